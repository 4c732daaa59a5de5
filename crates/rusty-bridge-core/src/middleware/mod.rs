mod filters;
mod forward;
mod logger;
mod origin;
mod subscriptions;

pub use filters::FilterMiddleware;
pub use forward::ForwardMiddleware;
pub use logger::LoggerMiddleware;
pub use origin::OriginMiddleware;
pub use subscriptions::SubscriptionMiddleware;

use serde_json::Value;

pub(crate) fn to_hex(n: u64) -> String {
    format!("0x{n:x}")
}

pub(crate) fn parse_hex_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => {
            let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
            u64::from_str_radix(digits, 16).ok()
        }
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hex_quantities_round_trip() {
        assert_eq!(to_hex(255), "0xff");
        assert_eq!(parse_hex_u64(&json!("0xff")), Some(255));
        assert_eq!(parse_hex_u64(&json!(12)), Some(12));
        assert_eq!(parse_hex_u64(&json!("12")), None);
    }
}
