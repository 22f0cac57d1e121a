use async_trait::async_trait;
use quick_xml::Reader as XmlReader;
use quick_xml::events::{BytesStart, Event};
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum CasError {
    #[error("CAS server rejected the proxy ticket request ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("unexpected CAS response: {0}")]
    UnexpectedResponse(String),
    #[error("CAS request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("invalid CAS server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl From<reqwest::Error> for CasError {
    fn from(e: reqwest::Error) -> Self {
        // The request URL carries the proxy-granting ticket.
        CasError::Transport(e.without_url())
    }
}

/// Issues proxy tickets for a target service on behalf of a session.
#[async_trait]
pub trait ProxyTicketSource: Send + Sync {
    async fn proxy_ticket(
        &self,
        proxy_granting_ticket: &str,
        target_service: &str,
    ) -> Result<String, CasError>;
}

/// Requests proxy tickets from the CAS server's `/proxy` endpoint.
pub struct CasServerTicketSource {
    proxy_url: Url,
    client: reqwest::Client,
}

impl CasServerTicketSource {
    pub fn new(server_url: &Url, timeout: Duration) -> Result<Self, CasError> {
        let mut base = server_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(CasServerTicketSource {
            proxy_url: base.join("proxy")?,
            client,
        })
    }
}

#[async_trait]
impl ProxyTicketSource for CasServerTicketSource {
    async fn proxy_ticket(
        &self,
        proxy_granting_ticket: &str,
        target_service: &str,
    ) -> Result<String, CasError> {
        let response = self
            .client
            .get(self.proxy_url.clone())
            .query(&[("pgt", proxy_granting_ticket), ("targetService", target_service)])
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        parse_proxy_response(&body)
    }
}

#[derive(Clone, Copy)]
enum Field {
    Ticket,
    Failure,
}

/// Reads a `/proxy` response. Namespace prefixes are ignored, so any prefix
/// bound to the CAS namespace works.
fn parse_proxy_response(body: &str) -> Result<String, CasError> {
    let mut reader = XmlReader::from_str(body);
    reader.trim_text(true);

    let mut field = None;
    let mut ticket = String::new();
    let mut failure: Option<(String, String)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"proxyTicket" => field = Some(Field::Ticket),
                b"proxyFailure" => {
                    field = Some(Field::Failure);
                    failure = Some((failure_code(e), String::new()));
                }
                _ => field = None,
            },
            Ok(Event::Empty(ref e)) if e.local_name().as_ref() == b"proxyFailure" => {
                failure = Some((failure_code(e), String::new()));
            }
            Ok(Event::Text(ref t)) => {
                let text = t.unescape().map_err(invalid_xml)?;
                match (field, failure.as_mut()) {
                    (Some(Field::Ticket), _) => ticket.push_str(&text),
                    (Some(Field::Failure), Some((_, message))) => message.push_str(&text),
                    _ => {}
                }
            }
            Ok(Event::End(_)) => field = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(invalid_xml(e)),
            _ => {}
        }
    }

    if !ticket.is_empty() {
        return Ok(ticket);
    }
    if let Some((code, message)) = failure {
        return Err(CasError::Rejected { code, message });
    }

    Err(CasError::UnexpectedResponse(
        body.chars().take(200).collect::<String>(),
    ))
}

fn failure_code(element: &BytesStart<'_>) -> String {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == b"code")
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn invalid_xml(e: quick_xml::Error) -> CasError {
    CasError::UnexpectedResponse(format!("invalid XML: {e}"))
}
