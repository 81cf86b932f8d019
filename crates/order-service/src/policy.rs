//! 消费端业务规则
//!
//! 规则是可替换的：输入事件，返回处理后的事件或业务拒绝。

use async_trait::async_trait;

use crate::error::{OrderError, Result};
use crate::models::{OrderEvent, OrderStatus};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BusinessPolicy: Send + Sync {
    async fn apply(&self, event: OrderEvent) -> Result<OrderEvent>;
}

/// 默认规则：拒绝校验失败的订单，其余原样通过
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectValidationFailed;

#[async_trait]
impl BusinessPolicy for RejectValidationFailed {
    async fn apply(&self, event: OrderEvent) -> Result<OrderEvent> {
        if event.status == OrderStatus::ValidationFailed {
            return Err(OrderError::BusinessLogic(
                "Downstream refused invalid order".to_string(),
            ));
        }
        Ok(event)
    }
}
