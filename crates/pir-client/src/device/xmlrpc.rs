// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! XML-RPC message encoding.
//!
//! Only the subset needed to talk to the sampler is supported: scalar values,
//! arrays, structs, `<nil/>`, and fault responses.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::DeviceError;

/// An XML-RPC value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Double(f64),
    Str(String),
    Base64(Vec<u8>),
    Array(Vec<Value>),
    Struct(Vec<(String, Value)>),
    Nil,
}

impl Value {
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a struct member by name.
    #[must_use]
    pub fn member(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Struct(members) => members.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// Build a `<methodCall>` document.
#[must_use]
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        write_value(&mut out, param);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>\n");
    out
}

fn write_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Int(v) => {
            let tag = if i32::try_from(*v).is_ok() { "int" } else { "i8" };
            out.push_str(&format!("<{tag}>{v}</{tag}>"));
        }
        Value::Bool(b) => out.push_str(if *b {
            "<boolean>1</boolean>"
        } else {
            "<boolean>0</boolean>"
        }),
        Value::Double(v) => out.push_str(&format!("<double>{v}</double>")),
        Value::Str(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s.as_str()));
            out.push_str("</string>");
        }
        Value::Base64(bytes) => {
            out.push_str("<base64>");
            out.push_str(&STANDARD.encode(bytes));
            out.push_str("</base64>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str("<member><name>");
                out.push_str(&escape(name.as_str()));
                out.push_str("</name>");
                write_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
        Value::Nil => out.push_str("<nil/>"),
    }
    out.push_str("</value>");
}

/// Parse a `<methodResponse>` document.
///
/// A `<fault>` response becomes [`DeviceError::Fault`]. A response without a
/// parameter yields [`Value::Nil`].
pub fn decode_response(text: &str) -> Result<Value, DeviceError> {
    let mut parser = Parser::new(text);
    parser.expect_start("methodResponse")?;

    match parser.next()? {
        Event::Start(e) if e.name().as_ref() == b"params" => {
            let value = match parser.next()? {
                Event::Start(p) if p.name().as_ref() == b"param" => {
                    parser.expect_start("value")?;
                    let value = parser.value()?;
                    parser.expect_end("param")?;
                    parser.expect_end("params")?;
                    value
                }
                Event::End(p) if p.name().as_ref() == b"params" => Value::Nil,
                other => return Err(unexpected("<param>", &other)),
            };
            parser.expect_end("methodResponse")?;
            Ok(value)
        }
        Event::Empty(e) if e.name().as_ref() == b"params" => Ok(Value::Nil),
        Event::Start(e) if e.name().as_ref() == b"fault" => {
            parser.expect_start("value")?;
            let fault = parser.value()?;
            let code = fault
                .member("faultCode")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            let message = fault
                .member("faultString")
                .and_then(Value::as_str)
                .unwrap_or("unknown fault")
                .to_string();
            Err(DeviceError::Fault { code, message })
        }
        other => Err(unexpected("<params> or <fault>", &other)),
    }
}

fn protocol(message: impl Into<String>) -> DeviceError {
    DeviceError::Protocol(message.into())
}

fn unexpected(wanted: &str, found: &Event<'_>) -> DeviceError {
    let found = match found {
        Event::Start(e) => format!("<{}>", String::from_utf8_lossy(e.name().as_ref())),
        Event::End(e) => format!("</{}>", String::from_utf8_lossy(e.name().as_ref())),
        Event::Empty(e) => format!("<{}/>", String::from_utf8_lossy(e.name().as_ref())),
        Event::Text(_) | Event::CData(_) => "text".to_string(),
        Event::Eof => "end of document".to_string(),
        _ => "markup".to_string(),
    };
    protocol(format!("expected {wanted}, found {found}"))
}

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);
        Self { reader }
    }

    /// Next structural event, skipping declarations and comments.
    fn next(&mut self) -> Result<Event<'a>, DeviceError> {
        loop {
            let event = self
                .reader
                .read_event()
                .map_err(|e| protocol(format!("malformed XML: {e}")))?;
            match event {
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                other => return Ok(other),
            }
        }
    }

    fn expect_start(&mut self, name: &str) -> Result<(), DeviceError> {
        match self.next()? {
            Event::Start(e) if e.name().as_ref() == name.as_bytes() => Ok(()),
            other => Err(unexpected(&format!("<{name}>"), &other)),
        }
    }

    fn expect_end(&mut self, name: &str) -> Result<(), DeviceError> {
        match self.next()? {
            Event::End(e) if e.name().as_ref() == name.as_bytes() => Ok(()),
            other => Err(unexpected(&format!("</{name}>"), &other)),
        }
    }

    /// Text content of an element whose start tag was just consumed.
    fn text_until_end(&mut self, name: &str) -> Result<String, DeviceError> {
        match self.next()? {
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| protocol(format!("bad text in <{name}>: {e}")))?
                    .into_owned();
                self.expect_end(name)?;
                Ok(text)
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                self.expect_end(name)?;
                Ok(text)
            }
            Event::End(e) if e.name().as_ref() == name.as_bytes() => Ok(String::new()),
            other => Err(unexpected(&format!("text or </{name}>"), &other)),
        }
    }

    /// Parse a value whose `<value>` start tag was just consumed, through `</value>`.
    fn value(&mut self) -> Result<Value, DeviceError> {
        let value = match self.next()? {
            Event::End(e) if e.name().as_ref() == b"value" => return Ok(Value::Str(String::new())),
            Event::Text(t) => {
                let text = t
                    .unescape()
                    .map_err(|e| protocol(format!("bad text in <value>: {e}")))?
                    .into_owned();
                Value::Str(text)
            }
            Event::Empty(e) => match e.name().as_ref() {
                b"nil" => Value::Nil,
                b"string" => Value::Str(String::new()),
                b"base64" => Value::Base64(Vec::new()),
                b"array" => Value::Array(Vec::new()),
                b"struct" => Value::Struct(Vec::new()),
                other => {
                    return Err(protocol(format!(
                        "unsupported value type <{}/>",
                        String::from_utf8_lossy(other)
                    )))
                }
            },
            Event::Start(e) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                self.typed_value(&tag)?
            }
            other => return Err(unexpected("a value", &other)),
        };
        self.expect_end("value")?;
        Ok(value)
    }

    fn typed_value(&mut self, tag: &str) -> Result<Value, DeviceError> {
        match tag {
            "int" | "i4" | "i8" => {
                let text = self.text_until_end(tag)?;
                text.trim()
                    .parse()
                    .map(Value::Int)
                    .map_err(|e| protocol(format!("invalid integer '{text}': {e}")))
            }
            "boolean" => match self.text_until_end(tag)?.trim() {
                "1" | "true" => Ok(Value::Bool(true)),
                "0" | "false" => Ok(Value::Bool(false)),
                other => Err(protocol(format!("invalid boolean '{other}'"))),
            },
            "double" => {
                let text = self.text_until_end(tag)?;
                text.trim()
                    .parse()
                    .map(Value::Double)
                    .map_err(|e| protocol(format!("invalid double '{text}': {e}")))
            }
            "string" | "dateTime.iso8601" => self.text_until_end(tag).map(Value::Str),
            "base64" => {
                let text = self.text_until_end(tag)?;
                let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
                STANDARD
                    .decode(compact.as_bytes())
                    .map(Value::Base64)
                    .map_err(|e| protocol(format!("invalid base64 value: {e}")))
            }
            "nil" => {
                self.expect_end("nil")?;
                Ok(Value::Nil)
            }
            "array" => self.array(),
            "struct" => self.structure(),
            other => Err(protocol(format!("unsupported value type <{other}>"))),
        }
    }

    fn array(&mut self) -> Result<Value, DeviceError> {
        let mut items = Vec::new();
        match self.next()? {
            Event::Empty(e) if e.name().as_ref() == b"data" => {}
            Event::Start(e) if e.name().as_ref() == b"data" => loop {
                match self.next()? {
                    Event::Start(v) if v.name().as_ref() == b"value" => items.push(self.value()?),
                    Event::End(d) if d.name().as_ref() == b"data" => break,
                    other => return Err(unexpected("<value> or </data>", &other)),
                }
            },
            other => return Err(unexpected("<data>", &other)),
        }
        self.expect_end("array")?;
        Ok(Value::Array(items))
    }

    fn structure(&mut self) -> Result<Value, DeviceError> {
        let mut members = Vec::new();
        loop {
            match self.next()? {
                Event::Start(e) if e.name().as_ref() == b"member" => {
                    self.expect_start("name")?;
                    let name = self.text_until_end("name")?;
                    self.expect_start("value")?;
                    let value = self.value()?;
                    self.expect_end("member")?;
                    members.push((name, value));
                }
                Event::End(e) if e.name().as_ref() == b"struct" => break,
                other => return Err(unexpected("<member> or </struct>", &other)),
            }
        }
        Ok(Value::Struct(members))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_call() {
        let body = encode_call(
            "one_shot",
            &[Value::Int(3), Value::Str("input".to_string()), Value::Bool(true)],
        );
        assert_eq!(
            body,
            "<?xml version=\"1.0\"?>\n<methodCall><methodName>one_shot</methodName><params>\
             <param><value><int>3</int></value></param>\
             <param><value><string>input</string></value></param>\
             <param><value><boolean>1</boolean></value></param>\
             </params></methodCall>\n"
        );
    }

    #[test]
    fn test_encode_escapes_strings() {
        let body = encode_call("m", &[Value::Str("a<b&c".to_string())]);
        assert!(body.contains("<string>a&lt;b&amp;c</string>"));
    }

    #[test]
    fn test_decode_string_response() {
        let xml = "<?xml version='1.0'?>\n<methodResponse>\n<params>\n<param>\n\
                   <value><string>k05VTVBZ</string></value>\n</param>\n</params>\n</methodResponse>\n";
        assert_eq!(decode_response(xml).unwrap(), Value::Str("k05VTVBZ".to_string()));
    }

    #[test]
    fn test_decode_untyped_value_is_string() {
        let xml = "<methodResponse><params><param><value>abc</value></param></params></methodResponse>";
        assert_eq!(decode_response(xml).unwrap(), Value::Str("abc".to_string()));
    }

    #[test]
    fn test_decode_nil_and_empty_params() {
        let nil = "<methodResponse><params><param><value><nil/></value></param></params></methodResponse>";
        assert_eq!(decode_response(nil).unwrap(), Value::Nil);

        let empty = "<methodResponse><params></params></methodResponse>";
        assert_eq!(decode_response(empty).unwrap(), Value::Nil);
    }

    #[test]
    fn test_decode_nested_values() {
        let xml = "<methodResponse><params><param><value><array><data>\
                   <value><i4>-7</i4></value>\
                   <value><double>2.5</double></value>\
                   <value><boolean>0</boolean></value>\
                   <value><base64>AQID</base64></value>\
                   </data></array></value></param></params></methodResponse>";
        assert_eq!(
            decode_response(xml).unwrap(),
            Value::Array(vec![
                Value::Int(-7),
                Value::Double(2.5),
                Value::Bool(false),
                Value::Base64(vec![1, 2, 3]),
            ])
        );
    }

    #[test]
    fn test_decode_fault() {
        let xml = "<methodResponse><fault><value><struct>\
                   <member><name>faultCode</name><value><int>4</int></value></member>\
                   <member><name>faultString</name><value><string>no such channel</string></value></member>\
                   </struct></value></fault></methodResponse>";
        match decode_response(xml) {
            Err(DeviceError::Fault { code, message }) => {
                assert_eq!(code, 4);
                assert_eq!(message, "no such channel");
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_response("<html><body>502</body></html>"),
            Err(DeviceError::Protocol(_))
        ));
        assert!(matches!(
            decode_response("<methodResponse><params><param><value><int>x</int></value></param></params></methodResponse>"),
            Err(DeviceError::Protocol(_))
        ));
    }
}
