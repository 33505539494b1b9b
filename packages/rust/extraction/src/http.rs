//! HTTP agent that reads records out of HTML tables.
//!
//! The list page for a recipient holds one table: its header cells name the
//! base columns and each body row is one record, keyed by its first cell.
//! A record's detail page holds any number of tables whose body rows are
//! label/value pairs; each label becomes a detail column.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};
use url::{Url, form_urlencoded};

use recsync_shared::{
    AgentConfig, BasicRecord, FieldMap, RecsyncError, Result, detail_column_name,
};

use crate::agent::{ExtractionAgent, ExtractionError};

/// User-Agent string for portal requests.
const USER_AGENT: &str = concat!("recsync/", env!("CARGO_PKG_VERSION"));

/// [`ExtractionAgent`] over plain HTTP GETs and HTML table scraping.
pub struct HttpTableAgent {
    client: Client,
    base_url: Url,
    list_path: String,
    detail_path: String,
    detail_suffix: String,
}

impl HttpTableAgent {
    /// Create an agent from the `[agent]` config section.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            RecsyncError::config(format!("invalid agent base_url '{}': {e}", config.base_url))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RecsyncError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            list_path: config.list_path.clone(),
            detail_path: config.detail_path.clone(),
            detail_suffix: config.detail_suffix.clone(),
        })
    }

    fn endpoint(&self, template: &str, placeholder: &str, value: &str) -> std::result::Result<Url, ExtractionError> {
        let encoded: String = form_urlencoded::byte_serialize(value.as_bytes()).collect();
        let path = template.replace(placeholder, &encoded);
        self.base_url
            .join(&path)
            .map_err(|e| ExtractionError::fatal(format!("cannot build URL from '{path}': {e}")))
    }

    async fn get_html(&self, url: &Url) -> std::result::Result<String, ExtractionError> {
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| ExtractionError::transient(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(url, status));
        }

        response
            .text()
            .await
            .map_err(|e| ExtractionError::transient(format!("{url}: body read failed: {e}")))
    }
}

#[async_trait]
impl ExtractionAgent for HttpTableAgent {
    #[instrument(skip(self))]
    async fn fetch_basic_list(
        &mut self,
        recipient: &str,
    ) -> std::result::Result<Vec<BasicRecord>, ExtractionError> {
        let url = self.endpoint(&self.list_path, "{recipient}", recipient)?;
        let body = self.get_html(&url).await?;
        let records = parse_basic_list(&body)?;
        debug!(%url, records = records.len(), "parsed basic list");
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn fetch_detail(&mut self, record_id: &str) -> std::result::Result<FieldMap, ExtractionError> {
        let url = self.endpoint(&self.detail_path, "{record_id}", record_id)?;
        let body = self.get_html(&url).await?;
        let fields = parse_detail(&body, &self.detail_suffix)?;
        debug!(%url, fields = fields.len(), "parsed detail page");
        Ok(fields)
    }

    fn name(&self) -> &str {
        "http-table"
    }
}

/// Rate limiting, timeouts and server errors are worth retrying; the rest is not.
fn classify_status(url: &Url, status: StatusCode) -> ExtractionError {
    let msg = format!("{url}: HTTP {status}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        ExtractionError::Transient(msg)
    } else {
        ExtractionError::Fatal(msg)
    }
}

fn selector(css: &str) -> std::result::Result<Selector, ExtractionError> {
    Selector::parse(css).map_err(|e| ExtractionError::fatal(format!("bad selector '{css}': {e}")))
}

/// Whitespace-collapsed text content of an element.
fn cell_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a recipient's list page into records.
pub fn parse_basic_list(html: &str) -> std::result::Result<Vec<BasicRecord>, ExtractionError> {
    let doc = Html::parse_document(html);
    let table_sel = selector("table")?;
    let header_sel = selector("thead th")?;
    let first_row_header_sel = selector("tr th")?;
    let row_sel = selector("tbody tr")?;
    let cell_sel = selector("td")?;

    let table = doc
        .select(&table_sel)
        .next()
        .ok_or_else(|| ExtractionError::fatal("list page contains no table"))?;

    let mut headers: Vec<String> = table.select(&header_sel).map(cell_text).collect();
    if headers.is_empty() {
        headers = table.select(&first_row_header_sel).map(cell_text).collect();
    }
    if headers.is_empty() {
        return Err(ExtractionError::fatal("list table has no header cells"));
    }
    let headers: Vec<String> = headers
        .into_iter()
        .enumerate()
        .map(|(i, h)| if h.is_empty() { format!("Column {}", i + 1) } else { h })
        .collect();

    let mut records = Vec::new();
    for row in table.select(&row_sel) {
        let cells: Vec<String> = row.select(&cell_sel).map(cell_text).collect();
        let Some(record_id) = cells.first().filter(|id| !id.is_empty()).cloned() else {
            continue;
        };
        let fields: FieldMap = headers.iter().cloned().zip(cells).collect();
        records.push(BasicRecord::new(record_id, fields));
    }

    Ok(records)
}

/// Parse a detail page into suffixed detail columns.
pub fn parse_detail(html: &str, suffix: &str) -> std::result::Result<FieldMap, ExtractionError> {
    let doc = Html::parse_document(html);
    let row_sel = selector("table tbody tr")?;
    let cell_sel = selector("th, td")?;

    let mut fields = FieldMap::new();
    for row in doc.select(&row_sel) {
        let mut cells = row.select(&cell_sel).map(cell_text);
        let (Some(label), Some(value)) = (cells.next(), cells.next()) else {
            continue;
        };
        if label.is_empty() {
            continue;
        }
        fields.insert(detail_column_name(&label, suffix), value);
    }

    if fields.is_empty() {
        return Err(ExtractionError::fatal("detail page contains no label/value rows"));
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LIST_PAGE: &str = r#"<html><body>
        <table>
          <thead><tr><th>Application Number</th><th>Status</th><th>Due Date</th></tr></thead>
          <tbody>
            <tr><td><a href="/records/A1">A1</a></td><td>New</td><td>2024-01-10</td></tr>
            <tr><td>  </td><td>orphan</td><td></td></tr>
            <tr><td>A2</td><td><span>Closed</span></td><td>2024-02-11</td></tr>
          </tbody>
        </table>
    </body></html>"#;

    const DETAIL_PAGE: &str = r#"<html><body>
        <table><tbody>
            <tr><th>Title</th><td>Widget   Assembly</td></tr>
            <tr><td>Filing Date</td><td>2023-12-01</td></tr>
            <tr><td>lonely cell</td></tr>
        </tbody></table>
        <table><thead><tr><th>Label</th><th>Value</th></tr></thead><tbody>
            <tr><td>Agent</td><td>Smith &amp; Co</td></tr>
        </tbody></table>
    </body></html>"#;

    fn agent_for(server: &MockServer) -> HttpTableAgent {
        let config = AgentConfig {
            base_url: server.uri(),
            timeout_secs: 5,
            ..AgentConfig::default()
        };
        HttpTableAgent::new(&config).unwrap()
    }

    #[test]
    fn parses_list_table() {
        let records = parse_basic_list(LIST_PAGE).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_id, "A1");
        assert_eq!(records[0].fields["Status"], "New");
        assert_eq!(records[1].fields["Status"], "Closed");
        assert_eq!(
            records[1].fields.keys().collect::<Vec<_>>(),
            ["Application Number", "Status", "Due Date"]
        );
    }

    #[test]
    fn list_without_table_is_fatal() {
        let err = parse_basic_list("<html><body><p>Loading…</p></body></html>").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn parses_detail_pairs_with_suffix() {
        let fields = parse_detail(DETAIL_PAGE, "_AD").unwrap();
        assert_eq!(fields["Title_AD"], "Widget Assembly");
        assert_eq!(fields["Filing Date_AD"], "2023-12-01");
        assert_eq!(fields["Agent_AD"], "Smith & Co");
        assert!(!fields.contains_key("Label_AD"));
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn empty_detail_is_fatal() {
        let err = parse_detail("<table><tbody></tbody></table>", "_AD").unwrap_err();
        assert!(matches!(err, ExtractionError::Fatal(_)));
    }

    #[tokio::test]
    async fn fetches_list_and_detail_over_http() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/records"))
            .and(query_param("recipient", "a@example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LIST_PAGE))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/records/A1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(DETAIL_PAGE))
            .mount(&server)
            .await;

        let mut agent = agent_for(&server);
        let records = agent.fetch_basic_list("a@example.com").await.unwrap();
        assert_eq!(records.len(), 2);

        let detail = agent.fetch_detail("A1").await.unwrap();
        assert_eq!(detail["Title_AD"], "Widget Assembly");
    }

    #[tokio::test]
    async fn server_errors_are_transient_and_client_errors_fatal() {
        let server = MockServer::start().await;

        Mock::given(path("/records/BUSY"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(path("/records/GONE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/records/SLOW"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let mut agent = agent_for(&server);
        assert!(agent.fetch_detail("BUSY").await.unwrap_err().is_retryable());
        assert!(agent.fetch_detail("SLOW").await.unwrap_err().is_retryable());
        assert!(!agent.fetch_detail("GONE").await.unwrap_err().is_retryable());
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let config = AgentConfig {
            base_url: "not a url".into(),
            ..AgentConfig::default()
        };
        let err = HttpTableAgent::new(&config).err().unwrap();
        assert!(err.to_string().contains("invalid agent base_url"));
    }
}
