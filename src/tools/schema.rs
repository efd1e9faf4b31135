//! 工具参数 JSON Schema 生成（schemars 自动生成）
//!
//! 内置工具的参数结构体派生 JsonSchema，由此生成 parameters_schema，避免手写 Schema 与实际解析不一致。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 返回类型 T 的 JSON Schema；序列化失败时退回空对象 schema
pub fn schema_value<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    })
}
