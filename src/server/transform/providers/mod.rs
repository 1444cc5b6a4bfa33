pub mod dynamic;
pub mod static_rules;

pub use dynamic::DynamicTransformer;
pub use static_rules::StaticTransformer;
