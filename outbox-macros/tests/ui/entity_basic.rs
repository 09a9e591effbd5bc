use outbox_domain::entity::Entity;
use outbox_macros::entity;

#[entity(id = i64)]
#[derive(Debug, Clone)]
struct Product {
    name: String,
}

#[entity]
struct Tenant {
    plan: String,
}

fn main() {
    let product = Product {
        id: 3,
        name: "lamp".into(),
    };
    assert_eq!(*product.id(), 3);

    let tenant = Tenant {
        id: "t-1".into(),
        plan: "pro".into(),
    };
    assert_eq!(tenant.id(), "t-1");
    let _ = &tenant.plan;
}
