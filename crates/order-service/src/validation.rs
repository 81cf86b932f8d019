//! 请求校验
//!
//! 基于 validator 的字段约束，只报告第一条违规。`ValidationErrors` 内部是无序的
//! HashMap，这里按字段声明顺序查找，保证同一请求每次报告的违规都相同。

use validator::{Validate, ValidationErrors};

use crate::error::OrderError;
use crate::models::OrderRequest;

/// 字段声明顺序：(Rust 字段名, 对外字段名)
const FIELD_ORDER: [(&str, &str); 4] = [
    ("order_id", "orderId"),
    ("customer_id", "customerId"),
    ("customer_name", "customerName"),
    ("amount", "amount"),
];

/// 单条违规
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl From<Violation> for OrderError {
    fn from(v: Violation) -> Self {
        OrderError::Validation {
            field: v.field,
            message: v.message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    FirstViolation(Violation),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// 订单请求校验器，无副作用
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderValidator;

impl OrderValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, request: &OrderRequest) -> ValidationResult {
        match request.validate() {
            Ok(()) => ValidationResult::Valid,
            Err(errors) => ValidationResult::FirstViolation(first_violation(&errors)),
        }
    }
}

fn first_violation(errors: &ValidationErrors) -> Violation {
    let field_errors = errors.field_errors();

    for (rust_name, wire_name) in FIELD_ORDER {
        if let Some(first) = field_errors.get(rust_name).and_then(|errs| errs.first()) {
            let message = first
                .message
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| first.code.to_string());
            return Violation {
                field: wire_name.to_string(),
                message,
            };
        }
    }

    // 出现未登记的字段时退化为整体描述
    Violation {
        field: "request".to_string(),
        message: errors.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(order_id: &str, customer_id: &str, name: &str, amount: f64) -> OrderRequest {
        OrderRequest {
            order_id: order_id.to_string(),
            customer_id: customer_id.to_string(),
            customer_name: name.to_string(),
            amount,
        }
    }

    fn violation(field: &str, message: &str) -> ValidationResult {
        ValidationResult::FirstViolation(Violation {
            field: field.to_string(),
            message: message.to_string(),
        })
    }

    #[test]
    fn test_valid_request() {
        let result = OrderValidator::new().validate(&request("O1", "C1", "Alice", 10.0));
        assert!(result.is_valid());
    }

    #[test]
    fn test_blank_customer_id() {
        let result = OrderValidator::new().validate(&request("O2", "", "Bob", 5.0));
        assert_eq!(result, violation("customerId", "must not be blank"));
    }

    #[test]
    fn test_whitespace_counts_as_blank() {
        let result = OrderValidator::new().validate(&request("O3", "C3", "   ", 5.0));
        assert_eq!(result, violation("customerName", "must not be blank"));
    }

    #[test]
    fn test_non_positive_amount() {
        let validator = OrderValidator::new();
        for amount in [0.0, -1.5] {
            let result = validator.validate(&request("O4", "C4", "Dan", amount));
            assert_eq!(result, violation("amount", "must be greater than 0"));
        }
    }

    #[test]
    fn test_first_violation_follows_declaration_order() {
        // 所有字段都不合法时总是报告 orderId
        let validator = OrderValidator::new();
        for _ in 0..16 {
            let result = validator.validate(&request("", "", "", -1.0));
            assert_eq!(result, violation("orderId", "must not be blank"));
        }

        let result = validator.validate(&request("O5", "C5", "", 0.0));
        assert_eq!(result, violation("customerName", "must not be blank"));
    }

    #[test]
    fn test_violation_into_error() {
        let err: OrderError = Violation {
            field: "amount".to_string(),
            message: "must be greater than 0".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "amount: must be greater than 0");
    }
}
