use eventdesk_core::OperatorId;

/// Operator context for a request.
///
/// Resolved by the upstream capability check and forwarded in the
/// `x-operator-id` header; present on every route except `/health`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorContext {
    operator_id: OperatorId,
}

impl OperatorContext {
    pub fn new(operator_id: OperatorId) -> Self {
        Self { operator_id }
    }

    pub fn operator_id(&self) -> &OperatorId {
        &self.operator_id
    }

    /// Rate limit key for an operation performed by this operator.
    pub fn rate_limit_key(&self, operation: &str) -> String {
        format!("admin:{}:{}", self.operator_id, operation)
    }
}
