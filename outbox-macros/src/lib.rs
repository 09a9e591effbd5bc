//! outbox-domain 的过程宏
//!
//! - `#[integration_event]`：补齐事件元数据字段并实现 `IntegrationEvent`；
//! - `#[entity]`：补齐标识字段并实现 `Entity`。
//!
use proc_macro::TokenStream;

mod entity;
mod integration_event;
mod utils;

/// 集成事件宏
/// - 若缺失则追加字段：`id: Uuid`、`entity_id: Option<String>`、`creation_date: DateTime<Utc>`
/// - 合并派生：`Debug`、`Clone`、`serde::Serialize`、`serde::Deserialize`
/// - 实现 `::outbox_domain::integration_event::IntegrationEvent`，
///   `TYPE_NAME` 默认为 `module_path!()::StructName`
/// - 支持参数：`#[integration_event(type_name = "billing.InvoiceIssued")]`
#[proc_macro_attribute]
pub fn integration_event(attr: TokenStream, item: TokenStream) -> TokenStream {
    integration_event::expand(attr, item)
}

/// 实体宏
/// - 若缺失则追加字段 `id: IdType` 并置于字段最前
/// - 实现 `::outbox_domain::entity::Entity`
/// - 支持参数：`#[entity(id = IdType)]`，默认 `String`
#[proc_macro_attribute]
pub fn entity(attr: TokenStream, item: TokenStream) -> TokenStream {
    entity::expand(attr, item)
}
