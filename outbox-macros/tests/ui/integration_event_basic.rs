use outbox_domain::integration_event::IntegrationEvent;
use outbox_macros::integration_event;

#[integration_event]
#[derive(PartialEq)]
struct ProductPriceChanged {
    product_id: i64,
    new_price: u64,
}

fn main() {
    let event = ProductPriceChanged {
        id: outbox_domain::uuid::Uuid::now_v7(),
        entity_id: None,
        creation_date: outbox_domain::chrono::Utc::now(),
        product_id: 1,
        new_price: 10,
    };
    assert_eq!(event.entity_id(), None);
    assert!(ProductPriceChanged::TYPE_NAME.ends_with("::ProductPriceChanged"));
}
