//! Decode XML-RPC method responses

use chrono::NaiveDateTime;
use roxmltree::{Document, Node};

use super::{Record, RpcValue};
use crate::api::error::RpcError;

/// A decoded `methodResponse`
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Success(RpcValue),
    Fault { code: String, message: String },
}

/// Parse a `methodResponse` body
pub fn decode_response(body: &str) -> Result<Response, RpcError> {
    let doc = Document::parse(body)
        .map_err(|e| RpcError::Malformed(format!("invalid XML in response: {}", e)))?;

    let root = doc.root_element();
    if root.tag_name().name() != "methodResponse" {
        return Err(RpcError::Malformed(format!(
            "expected methodResponse, found <{}>",
            root.tag_name().name()
        )));
    }

    if let Some(fault) = child(root, "fault") {
        let value = child(fault, "value")
            .ok_or_else(|| RpcError::Malformed("fault without value".to_string()))?;
        let value = parse_value(value)?;
        let code = value.get("faultCode").map(fault_text).unwrap_or_default();
        let message = value.get("faultString").map(fault_text).unwrap_or_default();
        return Ok(Response::Fault { code, message });
    }

    let value = child(root, "params")
        .and_then(|params| child(params, "param"))
        .and_then(|param| child(param, "value"))
        .ok_or_else(|| RpcError::Malformed("response without params".to_string()))?;

    Ok(Response::Success(parse_value(value)?))
}

fn fault_text(value: &RpcValue) -> String {
    match value {
        RpcValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_value(node: Node) -> Result<RpcValue, RpcError> {
    let Some(typed) = node.children().find(|n| n.is_element()) else {
        // Untyped values are strings
        return Ok(RpcValue::String(text_of(node)));
    };

    let text = || text_of(typed);
    match typed.tag_name().name() {
        "int" | "i4" | "i8" => text()
            .trim()
            .parse::<i64>()
            .map(RpcValue::Int)
            .map_err(|e| RpcError::Malformed(format!("bad integer: {}", e))),
        "boolean" => match text().trim() {
            "1" | "true" => Ok(RpcValue::Bool(true)),
            "0" | "false" => Ok(RpcValue::Bool(false)),
            other => Err(RpcError::Malformed(format!("bad boolean: {}", other))),
        },
        "double" => text()
            .trim()
            .parse::<f64>()
            .map(RpcValue::Double)
            .map_err(|e| RpcError::Malformed(format!("bad double: {}", e))),
        "string" => Ok(RpcValue::String(text())),
        "dateTime.iso8601" => {
            let raw = text();
            let raw = raw.trim();
            NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
                .map(RpcValue::DateTime)
                .or_else(|_| Ok(RpcValue::String(raw.to_string())))
        }
        "base64" => Ok(RpcValue::Base64(
            text().chars().filter(|c| !c.is_whitespace()).collect(),
        )),
        "nil" => Ok(RpcValue::Nil),
        "array" => {
            let Some(data) = child(typed, "data") else {
                return Ok(RpcValue::Array(Vec::new()));
            };
            data.children()
                .filter(|n| n.has_tag_name("value"))
                .map(parse_value)
                .collect::<Result<Vec<_>, _>>()
                .map(RpcValue::Array)
        }
        "struct" => {
            let mut members = Record::new();
            for member in typed.children().filter(|n| n.has_tag_name("member")) {
                let name = child(member, "name")
                    .map(text_of)
                    .ok_or_else(|| RpcError::Malformed("struct member without name".into()))?;
                let value = child(member, "value").ok_or_else(|| {
                    RpcError::Malformed(format!("member '{}' without value", name))
                })?;
                members.insert(name, parse_value(value)?);
            }
            Ok(RpcValue::Struct(members))
        }
        other => Err(RpcError::Malformed(format!("unsupported value type <{}>", other))),
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(tag))
}

fn text_of(node: Node) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_int_result() {
        let body = r#"<?xml version="1.0"?>
<methodResponse><params><param><value><int>42</int></value></param></params></methodResponse>"#;
        assert_eq!(decode_response(body).unwrap(), Response::Success(RpcValue::Int(42)));
    }

    #[test]
    fn test_decode_untyped_value_is_string() {
        let body = "<methodResponse><params><param><value>hello</value></param></params></methodResponse>";
        assert_eq!(
            decode_response(body).unwrap(),
            Response::Success(RpcValue::from("hello"))
        );
    }

    #[test]
    fn test_decode_read_result() {
        let body = r#"<methodResponse><params><param><value><array><data>
<value><struct>
  <member><name>id</name><value><int>7</int></value></member>
  <member><name>partner_id</name><value><array><data><value><int>3</int></value><value><string>Acme &amp; Co</string></value></data></array></value></member>
  <member><name>date</name><value><boolean>0</boolean></value></member>
  <member><name>note</name><value><nil/></value></member>
</struct></value>
</data></array></value></param></params></methodResponse>"#;

        let Response::Success(value) = decode_response(body).unwrap() else {
            panic!("expected success");
        };
        let records = value.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record["id"], RpcValue::Int(7));
        assert_eq!(record["partner_id"].relation_id(), Some(3));
        assert_eq!(
            record["partner_id"].as_array().unwrap()[1],
            RpcValue::from("Acme & Co")
        );
        assert_eq!(record["date"], RpcValue::Bool(false));
        assert_eq!(record["note"], RpcValue::Nil);
    }

    #[test]
    fn test_decode_fault() {
        let body = r#"<methodResponse><fault><value><struct>
<member><name>faultCode</name><value><int>1</int></value></member>
<member><name>faultString</name><value><string>Traceback...
ValueError: Invalid field 'foo' on model 'res.partner'</string></value></member>
</struct></value></fault></methodResponse>"#;

        match decode_response(body).unwrap() {
            Response::Fault { code, message } => {
                assert_eq!(code, "1");
                assert!(message.contains("Invalid field 'foo'"));
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        assert!(matches!(
            decode_response("<html>502 Bad Gateway"),
            Err(RpcError::Malformed(_))
        ));
        assert!(matches!(
            decode_response("<html><body/></html>"),
            Err(RpcError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_datetime() {
        let body = "<methodResponse><params><param><value><dateTime.iso8601>20240115T10:30:00</dateTime.iso8601></value></param></params></methodResponse>";
        let Response::Success(RpcValue::DateTime(dt)) = decode_response(body).unwrap() else {
            panic!("expected datetime");
        };
        assert_eq!(dt.format("%Y-%m-%d %H:%M").to_string(), "2024-01-15 10:30");
    }
}
