//! A minimal FalkorDB client speaking the RESP protocol over TCP.
//!
//! Statements go through `GRAPH.QUERY` in compact mode with the
//! parameters rendered as a `CYPHER name=value …` prelude. Compact
//! replies reference labels, relationship types and property keys by
//! ordinal; the connection caches the three schema tables and
//! refreshes them when an unknown ordinal shows up.

use crate::storage::driver::{
    CypherConnection, CypherDriver, CypherEdge, CypherNode, CypherValue, Point, Row,
};
use crate::storage::error::StorageError;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Arc;

const DEFAULT_PORT: u16 = 6379;

const LABELS_QUERY: &str = "CALL db.labels()";
const RELATIONSHIP_TYPES_QUERY: &str = "CALL db.relationshipTypes()";
const PROPERTY_KEYS_QUERY: &str = "CALL db.propertyKeys()";

/// A [`CypherDriver`] connecting to a FalkorDB server over plain TCP.
pub struct FalkorDriver {
    host: String,
    port: u16,
}

impl FalkorDriver {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Default for FalkorDriver {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

impl CypherDriver for FalkorDriver {
    fn connect(&self) -> Result<Box<dyn CypherConnection>, StorageError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))?;
        Ok(Box::new(FalkorConnection {
            stream: BufReader::new(stream),
            labels: Vec::new(),
            relationship_types: Vec::new(),
            property_keys: Vec::new(),
        }))
    }
}

struct FalkorConnection {
    stream: BufReader<TcpStream>,
    labels: Vec<String>,
    relationship_types: Vec<String>,
    property_keys: Vec<String>,
}

impl CypherConnection for FalkorConnection {
    fn execute(
        &mut self,
        graph: &str,
        cypher: &str,
        params: &[(String, CypherValue)],
    ) -> Result<Vec<Row>, StorageError> {
        let text = render_statement(cypher, params)?;
        let reply = self.graph_query(graph, &text)?;
        self.decode_reply(graph, reply)
    }
}

impl FalkorConnection {
    fn request(&mut self, args: &[&[u8]]) -> Result<Resp, StorageError> {
        let mut frame = Vec::new();
        frame.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            frame.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            frame.extend_from_slice(arg);
            frame.extend_from_slice(b"\r\n");
        }
        let stream = self.stream.get_mut();
        stream.write_all(&frame)?;
        stream.flush()?;
        read_resp(&mut self.stream)
    }

    fn graph_query(&mut self, graph: &str, text: &str) -> Result<Resp, StorageError> {
        let reply = self.request(&[b"GRAPH.QUERY", graph.as_bytes(), text.as_bytes(), b"--compact"])?;
        if let Resp::Error(message) = reply {
            return Err(StorageError::Protocol(message));
        }
        Ok(reply)
    }

    fn decode_reply(&mut self, graph: &str, reply: Resp) -> Result<Vec<Row>, StorageError> {
        let Resp::Array(mut items) = reply else {
            return Err(StorageError::protocol("GRAPH.QUERY did not return an array"));
        };
        if items.len() < 3 {
            // Statistics-only reply from a write statement.
            return Ok(Vec::new());
        }
        let raw_rows = items.swap_remove(1);
        let header = items.swap_remove(0);
        let columns: Arc<[String]> = decode_header(header)?.into();
        let Resp::Array(raw_rows) = raw_rows else {
            return Err(StorageError::protocol("malformed result set"));
        };
        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw_row in raw_rows {
            let Resp::Array(raw_values) = raw_row else {
                return Err(StorageError::protocol("malformed result row"));
            };
            let mut values = Vec::with_capacity(raw_values.len());
            for raw_value in &raw_values {
                values.push(self.decode_value(graph, raw_value)?);
            }
            rows.push(Row::new(Arc::clone(&columns), values));
        }
        Ok(rows)
    }

    fn decode_value(&mut self, graph: &str, value: &Resp) -> Result<CypherValue, StorageError> {
        let Resp::Array(pair) = value else {
            return Err(StorageError::protocol("compact value is not a type/value pair"));
        };
        let [Resp::Integer(value_type), payload] = pair.as_slice() else {
            return Err(StorageError::protocol("compact value is not a type/value pair"));
        };
        self.decode_typed(graph, *value_type, payload)
    }

    fn decode_typed(
        &mut self,
        graph: &str,
        value_type: i64,
        payload: &Resp,
    ) -> Result<CypherValue, StorageError> {
        Ok(match value_type {
            1 => CypherValue::Null,
            2 => CypherValue::String(payload.as_string()?),
            3 => match payload {
                Resp::Integer(i) => CypherValue::Integer(*i),
                _ => return Err(StorageError::protocol("malformed integer value")),
            },
            4 => match payload.as_string()?.as_str() {
                "true" => CypherValue::Boolean(true),
                "false" => CypherValue::Boolean(false),
                other => {
                    return Err(StorageError::protocol(format!(
                        "malformed boolean value {other:?}"
                    )));
                }
            },
            5 => CypherValue::Double(
                payload
                    .as_string()?
                    .parse()
                    .map_err(|_| StorageError::protocol("malformed double value"))?,
            ),
            6 => {
                let Resp::Array(items) = payload else {
                    return Err(StorageError::protocol("malformed array value"));
                };
                CypherValue::List(
                    items
                        .iter()
                        .map(|item| self.decode_value(graph, item))
                        .collect::<Result<_, _>>()?,
                )
            }
            7 => CypherValue::Edge(self.decode_edge(graph, payload)?),
            8 => CypherValue::Node(self.decode_node(graph, payload)?),
            10 => {
                let Resp::Array(items) = payload else {
                    return Err(StorageError::protocol("malformed map value"));
                };
                let mut entries = Vec::with_capacity(items.len() / 2);
                for entry in items.chunks(2) {
                    let [key, value] = entry else {
                        return Err(StorageError::protocol("malformed map value"));
                    };
                    entries.push((key.as_string()?, self.decode_value(graph, value)?));
                }
                CypherValue::Map(entries)
            }
            11 => {
                let Resp::Array(items) = payload else {
                    return Err(StorageError::protocol("malformed point value"));
                };
                let [latitude, longitude] = items.as_slice() else {
                    return Err(StorageError::protocol("malformed point value"));
                };
                CypherValue::Point(Point {
                    latitude: latitude
                        .as_string()?
                        .parse()
                        .map_err(|_| StorageError::protocol("malformed point value"))?,
                    longitude: longitude
                        .as_string()?
                        .parse()
                        .map_err(|_| StorageError::protocol("malformed point value"))?,
                })
            }
            other => {
                return Err(StorageError::protocol(format!(
                    "unsupported compact value type {other}"
                )));
            }
        })
    }

    fn decode_node(&mut self, graph: &str, payload: &Resp) -> Result<CypherNode, StorageError> {
        let Resp::Array(parts) = payload else {
            return Err(StorageError::protocol("malformed node value"));
        };
        let [Resp::Integer(id), Resp::Array(label_ids), Resp::Array(raw_properties)] =
            parts.as_slice()
        else {
            return Err(StorageError::protocol("malformed node value"));
        };
        let mut labels = Vec::with_capacity(label_ids.len());
        for label_id in label_ids {
            let Resp::Integer(label_id) = label_id else {
                return Err(StorageError::protocol("malformed node label"));
            };
            labels.push(self.label_name(graph, *label_id)?);
        }
        Ok(CypherNode {
            id: *id,
            labels,
            properties: self.decode_properties(graph, raw_properties)?,
        })
    }

    fn decode_edge(&mut self, graph: &str, payload: &Resp) -> Result<CypherEdge, StorageError> {
        let Resp::Array(parts) = payload else {
            return Err(StorageError::protocol("malformed edge value"));
        };
        let [
            Resp::Integer(id),
            Resp::Integer(type_id),
            Resp::Integer(src),
            Resp::Integer(dst),
            Resp::Array(raw_properties),
        ] = parts.as_slice()
        else {
            return Err(StorageError::protocol("malformed edge value"));
        };
        Ok(CypherEdge {
            id: *id,
            edge_type: self.relationship_type_name(graph, *type_id)?,
            src: *src,
            dst: *dst,
            properties: self.decode_properties(graph, raw_properties)?,
        })
    }

    fn decode_properties(
        &mut self,
        graph: &str,
        raw_properties: &[Resp],
    ) -> Result<Vec<(String, CypherValue)>, StorageError> {
        let mut properties = Vec::with_capacity(raw_properties.len());
        for raw_property in raw_properties {
            let Resp::Array(parts) = raw_property else {
                return Err(StorageError::protocol("malformed property"));
            };
            let [Resp::Integer(key_id), Resp::Integer(value_type), payload] = parts.as_slice()
            else {
                return Err(StorageError::protocol("malformed property"));
            };
            let key = self.property_key_name(graph, *key_id)?;
            properties.push((key, self.decode_typed(graph, *value_type, payload)?));
        }
        Ok(properties)
    }

    fn label_name(&mut self, graph: &str, id: i64) -> Result<String, StorageError> {
        if self.lookup(&self.labels, id).is_none() {
            self.labels = self.fetch_schema(graph, LABELS_QUERY)?;
        }
        self.lookup(&self.labels, id)
            .map(ToOwned::to_owned)
            .ok_or_else(|| StorageError::protocol(format!("unknown label ordinal {id}")))
    }

    fn relationship_type_name(&mut self, graph: &str, id: i64) -> Result<String, StorageError> {
        if self.lookup(&self.relationship_types, id).is_none() {
            self.relationship_types = self.fetch_schema(graph, RELATIONSHIP_TYPES_QUERY)?;
        }
        self.lookup(&self.relationship_types, id)
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                StorageError::protocol(format!("unknown relationship type ordinal {id}"))
            })
    }

    fn property_key_name(&mut self, graph: &str, id: i64) -> Result<String, StorageError> {
        if self.lookup(&self.property_keys, id).is_none() {
            self.property_keys = self.fetch_schema(graph, PROPERTY_KEYS_QUERY)?;
        }
        self.lookup(&self.property_keys, id)
            .map(ToOwned::to_owned)
            .ok_or_else(|| StorageError::protocol(format!("unknown property key ordinal {id}")))
    }

    fn lookup<'a>(&self, table: &'a [String], id: i64) -> Option<&'a str> {
        let index = usize::try_from(id).ok()?;
        table.get(index).map(String::as_str)
    }

    fn fetch_schema(&mut self, graph: &str, query: &str) -> Result<Vec<String>, StorageError> {
        let reply = self.graph_query(graph, query)?;
        let Resp::Array(items) = reply else {
            return Err(StorageError::protocol("malformed schema reply"));
        };
        if items.len() < 3 {
            return Ok(Vec::new());
        }
        let Resp::Array(rows) = &items[1] else {
            return Err(StorageError::protocol("malformed schema reply"));
        };
        rows.iter()
            .map(|row| {
                let Resp::Array(values) = row else {
                    return Err(StorageError::protocol("malformed schema reply"));
                };
                let Some(Resp::Array(pair)) = values.first() else {
                    return Err(StorageError::protocol("malformed schema reply"));
                };
                match pair.as_slice() {
                    [Resp::Integer(2), payload] => payload.as_string(),
                    _ => Err(StorageError::protocol("malformed schema reply")),
                }
            })
            .collect()
    }
}

/// Prepends the `CYPHER name=value …` parameter prelude when needed.
fn render_statement(
    cypher: &str,
    params: &[(String, CypherValue)],
) -> Result<String, StorageError> {
    if params.is_empty() {
        return Ok(cypher.into());
    }
    let mut text = String::from("CYPHER ");
    for (name, value) in params {
        text.push_str(name);
        text.push('=');
        write_cypher_literal(&mut text, value)?;
        text.push(' ');
    }
    text.push_str(cypher);
    Ok(text)
}

fn write_cypher_literal(out: &mut String, value: &CypherValue) -> Result<(), StorageError> {
    match value {
        CypherValue::Null => out.push_str("null"),
        CypherValue::Boolean(true) => out.push_str("true"),
        CypherValue::Boolean(false) => out.push_str("false"),
        CypherValue::Integer(i) => out.push_str(&i.to_string()),
        CypherValue::Double(d) => {
            if !d.is_finite() {
                return Err(StorageError::protocol(
                    "non-finite doubles cannot be sent as parameters",
                ));
            }
            out.push_str(&format!("{d:?}"));
        }
        CypherValue::String(s) => {
            out.push('"');
            for c in s.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c => out.push(c),
                }
            }
            out.push('"');
        }
        CypherValue::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_cypher_literal(out, item)?;
            }
            out.push(']');
        }
        CypherValue::Map(entries) => {
            out.push('{');
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push('`');
                out.push_str(&key.replace('`', "``"));
                out.push_str("`: ");
                write_cypher_literal(out, item)?;
            }
            out.push('}');
        }
        CypherValue::Point(_) | CypherValue::Node(_) | CypherValue::Edge(_) => {
            return Err(StorageError::protocol(
                "structured values cannot be sent as parameters",
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Resp {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Resp>),
}

impl Resp {
    fn as_string(&self) -> Result<String, StorageError> {
        match self {
            Self::Bulk(bytes) => String::from_utf8(bytes.clone())
                .map_err(|_| StorageError::protocol("reply is not valid UTF-8")),
            Self::Simple(s) => Ok(s.clone()),
            _ => Err(StorageError::protocol("expected a string reply")),
        }
    }
}

fn read_resp(reader: &mut impl BufRead) -> Result<Resp, StorageError> {
    let line = read_line(reader)?;
    if line.is_empty() {
        return Err(StorageError::protocol("empty reply line"));
    }
    let (kind, rest) = line.split_at(1);
    Ok(match kind {
        "+" => Resp::Simple(rest.into()),
        "-" => Resp::Error(rest.into()),
        ":" => Resp::Integer(parse_length(rest)?),
        "$" => {
            let length = parse_length(rest)?;
            if length < 0 {
                Resp::Nil
            } else {
                let length = usize::try_from(length)
                    .map_err(|_| StorageError::protocol("invalid bulk length"))?;
                let mut buffer = vec![0; length + 2];
                reader.read_exact(&mut buffer)?;
                buffer.truncate(length);
                Resp::Bulk(buffer)
            }
        }
        "*" => {
            let length = parse_length(rest)?;
            if length < 0 {
                Resp::Nil
            } else {
                let mut items = Vec::with_capacity(length.unsigned_abs() as usize);
                for _ in 0..length {
                    items.push(read_resp(reader)?);
                }
                Resp::Array(items)
            }
        }
        kind => {
            return Err(StorageError::protocol(format!(
                "unsupported reply prefix {kind:?}"
            )));
        }
    })
}

fn read_line(reader: &mut impl BufRead) -> Result<String, StorageError> {
    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    if !line.ends_with(b"\r\n") {
        return Err(StorageError::protocol("truncated reply line"));
    }
    line.truncate(line.len() - 2);
    String::from_utf8(line).map_err(|_| StorageError::protocol("reply is not valid UTF-8"))
}

fn parse_length(text: &str) -> Result<i64, StorageError> {
    text.parse()
        .map_err(|_| StorageError::protocol(format!("invalid reply length {text:?}")))
}

fn decode_header(header: Resp) -> Result<Vec<String>, StorageError> {
    let Resp::Array(entries) = header else {
        return Err(StorageError::protocol("malformed result header"));
    };
    entries
        .into_iter()
        .map(|entry| match entry {
            // Compact headers are (column kind, name) pairs.
            Resp::Array(pair) => pair
                .last()
                .ok_or_else(|| StorageError::protocol("malformed header entry"))?
                .as_string(),
            entry => entry.as_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn statement_rendering_inlines_parameters() -> Result<(), StorageError> {
        assert_eq!(render_statement("RETURN 1", &[])?, "RETURN 1");
        assert_eq!(
            render_statement(
                "MATCH (n {uri: $uri}) RETURN n",
                &[("uri".into(), CypherValue::String("http://example.com/\"a\"".into()))]
            )?,
            "CYPHER uri=\"http://example.com/\\\"a\\\"\" MATCH (n {uri: $uri}) RETURN n"
        );
        let mut rows = String::new();
        write_cypher_literal(
            &mut rows,
            &CypherValue::List(vec![CypherValue::Map(vec![
                ("uri".into(), "u".into()),
                ("value".into(), CypherValue::Double(1.5)),
            ])]),
        )?;
        assert_eq!(rows, "[{`uri`: \"u\", `value`: 1.5}]");
        Ok(())
    }

    #[test]
    fn resp_parsing_handles_nesting() -> Result<(), StorageError> {
        let mut input = Cursor::new(b"*2\r\n:42\r\n$5\r\nhello\r\n".to_vec());
        assert_eq!(
            read_resp(&mut input)?,
            Resp::Array(vec![Resp::Integer(42), Resp::Bulk(b"hello".to_vec())])
        );
        let mut error = Cursor::new(b"-Attribute 'uri' is already indexed\r\n".to_vec());
        assert_eq!(
            read_resp(&mut error)?,
            Resp::Error("Attribute 'uri' is already indexed".into())
        );
        Ok(())
    }

    #[test]
    fn truncated_replies_are_protocol_errors() {
        let mut input = Cursor::new(b"$5\r\nhel".to_vec());
        assert!(read_resp(&mut input).is_err());
    }
}
