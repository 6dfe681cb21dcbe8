//! Encode XML-RPC method calls

use std::io::Cursor;

use anyhow::Result;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::RpcValue;

type XmlWriter = Writer<Cursor<Vec<u8>>>;

/// Serialize a `methodCall` document
pub fn encode_call(method: &str, params: &[RpcValue]) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    open(&mut writer, "methodCall")?;
    text_element(&mut writer, "methodName", method)?;
    open(&mut writer, "params")?;
    for param in params {
        open(&mut writer, "param")?;
        write_value(&mut writer, param)?;
        close(&mut writer, "param")?;
    }
    close(&mut writer, "params")?;
    close(&mut writer, "methodCall")?;

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8(bytes)?)
}

fn write_value(w: &mut XmlWriter, value: &RpcValue) -> Result<()> {
    open(w, "value")?;
    match value {
        RpcValue::Nil => {
            w.write_event(Event::Empty(BytesStart::new("nil")))?;
        }
        RpcValue::Bool(b) => text_element(w, "boolean", if *b { "1" } else { "0" })?,
        RpcValue::Int(i) => {
            // i4 covers the common case; larger ids need the i8 extension
            let tag = if i32::try_from(*i).is_ok() { "int" } else { "i8" };
            text_element(w, tag, &i.to_string())?
        }
        RpcValue::Double(d) => text_element(w, "double", &d.to_string())?,
        RpcValue::String(s) => text_element(w, "string", s)?,
        RpcValue::DateTime(dt) => text_element(
            w,
            "dateTime.iso8601",
            &dt.format("%Y%m%dT%H:%M:%S").to_string(),
        )?,
        RpcValue::Base64(b) => text_element(w, "base64", b)?,
        RpcValue::Array(items) => {
            open(w, "array")?;
            open(w, "data")?;
            for item in items {
                write_value(w, item)?;
            }
            close(w, "data")?;
            close(w, "array")?;
        }
        RpcValue::Struct(members) => {
            open(w, "struct")?;
            for (name, member) in members {
                open(w, "member")?;
                text_element(w, "name", name)?;
                write_value(w, member)?;
                close(w, "member")?;
            }
            close(w, "struct")?;
        }
    }
    close(w, "value")
}

fn open(w: &mut XmlWriter, tag: &str) -> Result<()> {
    w.write_event(Event::Start(BytesStart::new(tag)))?;
    Ok(())
}

fn close(w: &mut XmlWriter, tag: &str) -> Result<()> {
    w.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn text_element(w: &mut XmlWriter, tag: &str, text: &str) -> Result<()> {
    open(w, tag)?;
    if !text.is_empty() {
        w.write_event(Event::Text(BytesText::new(text)))?;
    }
    close(w, tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_encode_scalar_params() {
        let xml = encode_call(
            "authenticate",
            &[
                RpcValue::from("prod"),
                RpcValue::from("admin"),
                RpcValue::Nil,
                RpcValue::Bool(true),
            ],
        )
        .unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<methodName>authenticate</methodName>"));
        assert!(xml.contains("<value><string>prod</string></value>"));
        assert!(xml.contains("<value><nil/></value>"));
        assert!(xml.contains("<value><boolean>1</boolean></value>"));
    }

    #[test]
    fn test_encode_escapes_text() {
        let xml = encode_call("x", &[RpcValue::from("Smith & <Sons>")]).unwrap();
        assert!(xml.contains("Smith &amp; &lt;Sons&gt;"));
    }

    #[test]
    fn test_encode_nested() {
        let mut line = BTreeMap::new();
        line.insert("quantity".to_string(), RpcValue::Double(3.0));
        let command = RpcValue::Array(vec![
            RpcValue::Int(0),
            RpcValue::Int(0),
            RpcValue::Struct(line),
        ]);
        let xml = encode_call("execute_kw", &[command]).unwrap();

        assert!(xml.contains(
            "<array><data><value><int>0</int></value><value><int>0</int></value>\
             <value><struct><member><name>quantity</name><value><double>3</double></value>\
             </member></struct></value></data></array>"
        ));
    }

    #[test]
    fn test_encode_large_int_uses_i8() {
        let xml = encode_call("x", &[RpcValue::Int(5_000_000_000)]).unwrap();
        assert!(xml.contains("<i8>5000000000</i8>"));
    }
}
