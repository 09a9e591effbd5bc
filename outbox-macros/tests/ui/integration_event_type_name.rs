use outbox_domain::chrono::{DateTime, Utc};
use outbox_domain::integration_event::IntegrationEvent;
use outbox_domain::uuid::Uuid;
use outbox_macros::integration_event;

// 已声明的元数据字段保持原位
#[integration_event(type_name = "catalog.StockDepleted")]
struct StockDepleted {
    sku: String,
    id: Uuid,
    creation_date: DateTime<Utc>,
    entity_id: Option<String>,
}

fn main() {
    assert_eq!(StockDepleted::TYPE_NAME, "catalog.StockDepleted");
    assert_eq!(StockDepleted::short_type_name(), "StockDepleted");
}
