use serde_json::Value;

/// Distinguishes "field absent" from "field explicitly null" in PATCH bodies.
pub enum NullableValue {
    Omitted,
    Null,
    String(String),
}

pub fn classify_nullable(optional_value: Option<&Value>) -> Result<NullableValue, String> {
    match optional_value {
        None => Ok(NullableValue::Omitted),
        Some(Value::Null) => Ok(NullableValue::Null),
        Some(Value::String(s)) => Ok(NullableValue::String(s.to_owned())),
        Some(other) => Err(format!("expected string or null, got {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_the_three_shapes() {
        assert!(matches!(classify_nullable(None), Ok(NullableValue::Omitted)));
        assert!(matches!(
            classify_nullable(Some(&Value::Null)),
            Ok(NullableValue::Null)
        ));
        match classify_nullable(Some(&json!("hello"))) {
            Ok(NullableValue::String(s)) => assert_eq!(s, "hello"),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn rejects_non_string_values() {
        assert!(classify_nullable(Some(&json!(42))).is_err());
        assert!(classify_nullable(Some(&json!({"a": 1}))).is_err());
    }
}
