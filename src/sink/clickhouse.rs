//! ClickHouse HTTP sink
//!
//! Rows go out as `INSERT INTO <db>.<table> FORMAT JSONEachRow` over the HTTP
//! interface, one request per table group. ClickHouse applies a single
//! JSONEachRow insert atomically for batches below `max_insert_block_size`,
//! which is the all-or-nothing behaviour the committer relies on.

use crate::config::ClickhouseConfig;
use crate::flatten::Row;
use crate::sink::{Sink, SinkError};
use async_trait::async_trait;

pub struct ClickhouseSink {
    client: reqwest::Client,
    url: String,
    database: String,
    user: String,
    password: String,
}

impl ClickhouseSink {
    pub fn new(config: &ClickhouseConfig) -> Result<Self, SinkError> {
        if config.url.trim().is_empty() {
            return Err(SinkError::Transport("ClickHouse URL must not be empty".to_string()));
        }

        // Per-insert timeouts are applied by flush_to_sink
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SinkError::Transport(format!("http client build failed: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn insert_query(&self, table: &str) -> String {
        format!(
            "INSERT INTO {}.{} FORMAT JSONEachRow",
            quote_identifier(&self.database),
            quote_identifier(table)
        )
    }
}

#[async_trait]
impl Sink for ClickhouseSink {
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }

        let body = encode_rows(rows)
            .map_err(|e| SinkError::Transport(format!("row encoding failed: {}", e)))?;

        let response = self
            .client
            .post(format!("{}/", self.url))
            .query(&[("query", self.insert_query(table))])
            .basic_auth(&self.user, Some(&self.password))
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Transport(format!("insert into {} failed: {}", table, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(classify_failure(table, status.as_u16(), message))
    }

    fn sink_type(&self) -> &'static str {
        "ClickHouse"
    }
}

/// Newline-delimited JSON, one object per row
pub fn encode_rows(rows: &[Row]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for row in rows {
        body.push_str(&serde_json::to_string(row)?);
        body.push('\n');
    }
    Ok(body)
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

// ClickHouse answers a missing table with code 60 (UNKNOWN_TABLE)
fn classify_failure(table: &str, status: u16, message: String) -> SinkError {
    if status == 404 || message.contains("UNKNOWN_TABLE") || message.contains("Code: 60.") {
        SinkError::UnknownTable(table.to_string())
    } else {
        SinkError::Rejected {
            table: table.to_string(),
            status,
            message: message.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flatten::Scalar;

    fn sink() -> ClickhouseSink {
        ClickhouseSink::new(&ClickhouseConfig {
            url: "http://localhost:8123/".to_string(),
            database: "analytics".to_string(),
            user: "default".to_string(),
            password: String::new(),
        })
        .unwrap()
    }

    #[test]
    fn test_insert_query_quotes_identifiers() {
        let sink = sink();
        assert_eq!(sink.url, "http://localhost:8123");
        assert_eq!(
            sink.insert_query("transfers"),
            "INSERT INTO `analytics`.`transfers` FORMAT JSONEachRow"
        );
        assert_eq!(
            sink.insert_query("odd`name"),
            "INSERT INTO `analytics`.`odd\\`name` FORMAT JSONEachRow"
        );
    }

    #[test]
    fn test_encode_rows() {
        let mut first = Row::new();
        first.insert("id".to_string(), Scalar::from("a"));
        first.insert("block_number".to_string(), Scalar::UInt(10));
        let mut second = Row::new();
        second.insert("id".to_string(), Scalar::from("b"));
        second.insert("flag".to_string(), Scalar::Bool(false));

        let body = encode_rows(&[first, second]).unwrap();
        assert_eq!(
            body,
            "{\"block_number\":10,\"id\":\"a\"}\n{\"flag\":false,\"id\":\"b\"}\n"
        );
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("t", 404, String::new()),
            SinkError::UnknownTable(ref t) if t == "t"
        ));
        assert!(matches!(
            classify_failure(
                "t",
                500,
                "Code: 60. DB::Exception: Table analytics.t doesn't exist. (UNKNOWN_TABLE)"
                    .to_string()
            ),
            SinkError::UnknownTable(_)
        ));
        assert!(matches!(
            classify_failure("t", 500, "Code: 27. Cannot parse input\n".to_string()),
            SinkError::Rejected { status: 500, ref message, .. } if message == "Code: 27. Cannot parse input"
        ));
    }

    #[test]
    fn test_empty_url_rejected() {
        let result = ClickhouseSink::new(&ClickhouseConfig {
            url: "  ".to_string(),
            database: "default".to_string(),
            user: "default".to_string(),
            password: String::new(),
        });
        assert!(result.is_err());
    }
}
