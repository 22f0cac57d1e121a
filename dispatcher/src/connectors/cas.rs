use super::{ConnectorError, OutboundRequest, UrlConnector, parse_address};
use crate::cas::ProxyTicketSource;
use crate::session::RequestContext;
use async_trait::async_trait;
use http::Method;
use std::sync::Arc;

/// Authenticates to CAS-protected services with a proxy ticket in the
/// `proxyTicket` query parameter.
pub struct CasConnector {
    tickets: Arc<dyn ProxyTicketSource>,
}

impl CasConnector {
    pub fn new(tickets: Arc<dyn ProxyTicketSource>) -> Self {
        CasConnector { tickets }
    }
}

#[async_trait]
impl UrlConnector for CasConnector {
    fn name(&self) -> &'static str {
        "cas"
    }

    async fn get_url_connection(
        &self,
        ctx: &RequestContext,
        address: &str,
    ) -> Result<OutboundRequest, ConnectorError> {
        let pgt = ctx
            .proxy_granting_ticket()
            .ok_or(ConnectorError::NotAuthenticated)?;

        let mut url = parse_address(address)?;
        // Tickets are issued for the service itself, not a particular query.
        let mut target_service = url.clone();
        target_service.set_query(None);
        target_service.set_fragment(None);

        let ticket = self
            .tickets
            .proxy_ticket(pgt, target_service.as_str())
            .await?;
        url.query_pairs_mut().append_pair("proxyTicket", &ticket);

        Ok(OutboundRequest::new(Method::GET, url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::CasError;
    use crate::session::Session;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTickets {
        requests: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ProxyTicketSource for RecordingTickets {
        async fn proxy_ticket(
            &self,
            proxy_granting_ticket: &str,
            target_service: &str,
        ) -> Result<String, CasError> {
            self.requests
                .lock()
                .unwrap()
                .push((proxy_granting_ticket.into(), target_service.into()));
            Ok("PT-42".into())
        }
    }

    fn cas_context() -> RequestContext {
        RequestContext::default().with_session(Session {
            principal: Some("alice".into()),
            username: Some("alice".into()),
            proxy_granting_ticket: Some("PGT-7".into()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_ticket_appended() {
        let tickets = Arc::new(RecordingTickets::default());
        let connector = CasConnector::new(tickets.clone());

        let request = connector
            .get_url_connection(&cas_context(), "http://groups.example.org/groups?limit=5")
            .await
            .unwrap();

        assert_eq!(
            request.url.as_str(),
            "http://groups.example.org/groups?limit=5&proxyTicket=PT-42"
        );
        assert_eq!(
            tickets.requests.lock().unwrap().as_slice(),
            &[("PGT-7".to_string(), "http://groups.example.org/groups".to_string())]
        );
    }

    #[tokio::test]
    async fn test_requires_proxy_granting_ticket() {
        let connector = CasConnector::new(Arc::new(RecordingTickets::default()));
        let err = connector
            .get_url_connection(&RequestContext::default(), "http://groups.example.org/")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::NotAuthenticated));
    }
}
