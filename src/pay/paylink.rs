//! ErgoPay requests: a dApp hands the wallet a transaction to sign, either
//! embedded in the link or behind a URL, and may want the tx id back.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    error::{Error, Result},
    explorer::Explorer,
    txdetails::{annotate_output_tokens, burned_tokens, reduce},
    types::{TokenRef, TransactionSummary},
    utils::uri::{is_paylink, is_static_paylink, paylink_payload, resolve_fetch_url},
};

use super::{decode_base64, decode_base64_url, HttpClient, Signer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSeverity {
    #[default]
    None,
    Information,
    Warning,
    Error,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayLinkRequest {
    pub reduced_tx: Option<Vec<u8>>,
    /// address the dApp built the transaction for
    pub address: Option<String>,
    pub message: Option<String>,
    pub severity: MessageSeverity,
    pub reply_to: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayLinkResponse {
    #[serde(default)]
    reduced_tx: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    message_severity: Option<MessageSeverity>,
    #[serde(default)]
    reply_to: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayLinkState {
    Received,
    Static,
    Fetching,
    Resolved,
    AwaitingSignature,
    Submitted,
    Replied,
    Done,
    Error,
}

impl PayLinkState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PayLinkState::Replied | PayLinkState::Done | PayLinkState::Error
        )
    }
}

#[derive(Clone, Debug)]
pub struct PayLinkEvent {
    pub generation: u64,
    pub state: PayLinkState,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PayLinkPreview {
    pub summary: TransactionSummary,
    pub burned_tokens: Vec<TokenRef>,
}

pub fn parse_static_paylink(uri: &str) -> Result<PayLinkRequest> {
    let payload = paylink_payload(uri)?;
    let reduced_tx = decode_base64_url(payload)
        .map_err(|e| Error::ResolutionFailed(format!("Invalid reduced transaction: {e}")))?;
    Ok(PayLinkRequest {
        reduced_tx: Some(reduced_tx),
        ..PayLinkRequest::default()
    })
}

/// Decodes what a dApp answered to the fetch. `address` is the one the
/// wallet substituted, if any.
pub fn parse_paylink_response(json: &str, address: Option<&str>) -> Result<PayLinkRequest> {
    let rep: PayLinkResponse = serde_json::from_str(json)
        .map_err(|e| Error::ResolutionFailed(format!("Invalid response: {e}")))?;
    if rep.reduced_tx.is_none() && rep.message.is_none() {
        return Err(Error::ResolutionFailed(
            "Response has neither a transaction nor a message".to_string(),
        ));
    }
    if let (Some(supplied), Some(requested)) = (address, rep.address.as_deref()) {
        if supplied != requested {
            return Err(Error::AddressMismatch {
                requested: requested.to_string(),
                supplied: supplied.to_string(),
            });
        }
    }
    let reduced_tx = rep
        .reduced_tx
        .map(|tx| {
            decode_base64_url(&tx)
                .or_else(|_| decode_base64(&tx))
                .map_err(|e| Error::ResolutionFailed(format!("Invalid reduced transaction: {e}")))
        })
        .transpose()?;
    Ok(PayLinkRequest {
        reduced_tx,
        address: rep.address,
        message: rep.message,
        severity: rep.message_severity.unwrap_or_default(),
        reply_to: rep.reply_to,
    })
}

pub fn reply_body(tx_id: &str) -> String {
    serde_json::json!({ "txId": tx_id }).to_string()
}

/// Lets another task abort a flow. Once cancelled, the flow publishes
/// nothing more and every call on it fails.
#[derive(Clone)]
pub struct PayLinkCancel(Arc<AtomicU64>);

impl PayLinkCancel {
    pub fn cancel(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct PayLinkFlow {
    uri: String,
    state: PayLinkState,
    request: Option<PayLinkRequest>,
    tx_id: Option<String>,
    generation: u64,
    current_generation: Arc<AtomicU64>,
    events: broadcast::Sender<PayLinkEvent>,
}

impl PayLinkFlow {
    pub fn new(uri: &str) -> Result<Self> {
        if !is_paylink(uri) {
            return Err(Error::NotPayLink);
        }
        let (events, _) = broadcast::channel(16);
        Ok(Self {
            uri: uri.trim().to_string(),
            state: PayLinkState::Received,
            request: None,
            tx_id: None,
            generation: 0,
            current_generation: Arc::new(AtomicU64::new(0)),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PayLinkEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PayLinkState {
        self.state
    }

    pub fn request(&self) -> Option<&PayLinkRequest> {
        self.request.as_ref()
    }

    pub fn tx_id(&self) -> Option<&str> {
        self.tx_id.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn canceller(&self) -> PayLinkCancel {
        PayLinkCancel(self.current_generation.clone())
    }

    pub fn cancel(&self) {
        self.canceller().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.current_generation.load(Ordering::SeqCst) != self.generation
    }

    fn check_live(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::InvalidState("Payment request was cancelled".to_string()));
        }
        if self.state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "Payment request already finished ({:?})",
                self.state
            )));
        }
        Ok(())
    }

    fn set_state(&mut self, state: PayLinkState) {
        self.publish(state, None);
    }

    fn publish(&mut self, state: PayLinkState, error: Option<String>) {
        if self.is_cancelled() {
            return;
        }
        self.state = state;
        let _ = self.events.send(PayLinkEvent {
            generation: self.generation,
            state,
            error,
        });
    }

    fn fail(&mut self, e: Error) -> Error {
        tracing::info!("Payment request failed: {e}");
        self.publish(PayLinkState::Error, Some(e.to_string()));
        e
    }

    /// Decodes a static link or fetches a dynamic one. `address` replaces
    /// the address placeholder of the link.
    pub async fn resolve(
        &mut self,
        http: &dyn HttpClient,
        address: Option<&str>,
    ) -> Result<&PayLinkRequest> {
        self.check_live()?;
        if self.state != PayLinkState::Received {
            return Err(Error::InvalidState(format!("Cannot resolve in {:?}", self.state)));
        }
        let request = if is_static_paylink(&self.uri) {
            self.set_state(PayLinkState::Static);
            parse_static_paylink(&self.uri)
        } else {
            self.set_state(PayLinkState::Fetching);
            self.fetch(http, address).await
        };
        // the flow may have been cancelled while we were waiting
        self.check_live()?;
        match request {
            Ok(request) => {
                self.set_state(PayLinkState::Resolved);
                Ok(&*self.request.insert(request))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn fetch(&self, http: &dyn HttpClient, address: Option<&str>) -> Result<PayLinkRequest> {
        let url = resolve_fetch_url(&self.uri, address)?;
        tracing::info!("Fetching payment request from {url}");
        let rep = http
            .get(&url)
            .await
            .map_err(|e| Error::ResolutionFailed(e.to_string()))?;
        parse_paylink_response(&rep, address)
    }

    fn reduced_tx(&self) -> Result<&[u8]> {
        self.request
            .as_ref()
            .and_then(|r| r.reduced_tx.as_deref())
            .ok_or_else(|| Error::InvalidState("Payment request has no transaction".to_string()))
    }

    /// Netted view of the transaction for the user to approve. Every
    /// spent box must be known to the explorer.
    pub async fn build_preview(
        &mut self,
        explorer: &dyn Explorer,
        signer: &dyn Signer,
    ) -> Result<PayLinkPreview> {
        self.check_live()?;
        if !matches!(
            self.state,
            PayLinkState::Resolved | PayLinkState::AwaitingSignature
        ) {
            return Err(Error::InvalidState(format!("Cannot preview in {:?}", self.state)));
        }
        let reduced_tx = self.reduced_tx()?.to_vec();
        let preview = preview_transaction(explorer, signer, &reduced_tx).await;
        self.check_live()?;
        match preview {
            Ok(preview) => {
                self.set_state(PayLinkState::AwaitingSignature);
                Ok(preview)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn sign(&mut self, signer: &dyn Signer, key: &[u8]) -> Result<Vec<u8>> {
        self.check_live()?;
        if !matches!(
            self.state,
            PayLinkState::Resolved | PayLinkState::AwaitingSignature
        ) {
            return Err(Error::InvalidState(format!("Cannot sign in {:?}", self.state)));
        }
        let reduced_tx = self.reduced_tx()?;
        match signer.sign(reduced_tx, key) {
            Ok(signed) => {
                if self.state != PayLinkState::AwaitingSignature {
                    self.set_state(PayLinkState::AwaitingSignature);
                }
                Ok(signed)
            }
            Err(e) => Err(self.fail(Error::SigningFailed(e.to_string()))),
        }
    }

    /// The signed transaction went out to the network
    pub fn submitted(&mut self, tx_id: &str) -> Result<()> {
        self.check_live()?;
        if self.state != PayLinkState::AwaitingSignature {
            return Err(Error::InvalidState(format!("Cannot submit in {:?}", self.state)));
        }
        self.tx_id = Some(tx_id.to_string());
        self.set_state(PayLinkState::Submitted);
        Ok(())
    }

    /// Tells the dApp the transaction id if it asked for it. A failed POST
    /// does not make the payment fail; returns whether the dApp got it.
    pub async fn send_reply(&mut self, http: &dyn HttpClient) -> Result<bool> {
        self.check_live()?;
        let tx_id = match (self.state, self.tx_id.clone()) {
            (PayLinkState::Submitted, Some(tx_id)) => tx_id,
            _ => {
                return Err(Error::InvalidState(format!("Cannot reply in {:?}", self.state)));
            }
        };
        let reply_to = self.request.as_ref().and_then(|r| r.reply_to.clone());
        let Some(reply_to) = reply_to else {
            self.set_state(PayLinkState::Done);
            return Ok(false);
        };
        let replied = match http.post_json(&reply_to, reply_body(&tx_id)).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Could not send tx id to {reply_to}: {e}");
                false
            }
        };
        self.check_live()?;
        self.set_state(if replied {
            PayLinkState::Replied
        } else {
            PayLinkState::Done
        });
        Ok(replied)
    }
}

pub async fn preview_transaction(
    explorer: &dyn Explorer,
    signer: &dyn Signer,
    reduced_tx: &[u8],
) -> Result<PayLinkPreview> {
    let view = signer
        .inspect(reduced_tx)
        .map_err(|e| Error::MalformedEnvelope(format!("reducedTx: {e}")))?;
    let mut inputs = vec![];
    for box_id in view.input_box_ids.iter() {
        let input = explorer
            .box_by_id(box_id)
            .await
            .map_err(|e| Error::IncompleteInputData(format!("{box_id}: {e}")))?
            .ok_or_else(|| Error::IncompleteInputData(box_id.clone()))?;
        inputs.push(input);
    }
    let outputs = annotate_output_tokens(&inputs, &view.outputs);
    let burned_tokens = burned_tokens(&inputs, &outputs);
    let summary = reduce(&TransactionSummary {
        id: view.id,
        inputs,
        outputs,
    })?;
    Ok(PayLinkPreview {
        summary,
        burned_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{boxed, MockExplorer, MockHttp, MockSigner};

    const DYNAMIC: &str = "ergopay://dapp.example.com/pay/#P2PK_ADDRESS#";
    const FETCH_URL: &str = "https://dapp.example.com/pay/9addr";

    fn drain(rx: &mut broadcast::Receiver<PayLinkEvent>) -> Vec<PayLinkState> {
        let mut states = vec![];
        while let Ok(e) = rx.try_recv() {
            states.push(e.state);
        }
        states
    }

    fn signer() -> MockSigner {
        let mut signer = MockSigner::default();
        signer.view.id = "tx1".to_string();
        signer.view.input_box_ids = vec!["b1".to_string()];
        signer.view.outputs = vec![
            boxed(None, "9addr", 900, &[("t1", 2)]),
            boxed(None, "9dapp", 99, &[]),
            boxed(None, "fee", 1, &[]),
        ];
        signer
    }

    fn explorer() -> MockExplorer {
        let explorer = MockExplorer::default();
        let mut input = boxed(Some("b1"), "9addr", 1000, &[("t1", 5)]);
        input.tokens[0].name = Some("Sigma".to_string());
        explorer.boxes.lock().insert("b1".to_string(), input);
        explorer
    }

    #[test]
    fn responses() {
        let r = parse_paylink_response(
            r#"{"reducedTx":"AQID","address":"9addr","message":"Thanks","messageSeverity":"WARNING","replyTo":"https://dapp.example.com/reply"}"#,
            Some("9addr"),
        )
        .unwrap();
        assert_eq!(r.reduced_tx, Some(vec![1, 2, 3]));
        assert_eq!(r.severity, MessageSeverity::Warning);
        assert_eq!(r.reply_to.as_deref(), Some("https://dapp.example.com/reply"));

        let message_only = parse_paylink_response(r#"{"message":"Nothing to do"}"#, None).unwrap();
        assert_eq!(message_only.reduced_tx, None);
        assert_eq!(message_only.severity, MessageSeverity::None);

        assert!(matches!(
            parse_paylink_response(r#"{"address":"9addr"}"#, None),
            Err(Error::ResolutionFailed(_))
        ));
        assert!(matches!(
            parse_paylink_response(r#"{"message":"x","messageSeverity":"LOUD"}"#, None),
            Err(Error::ResolutionFailed(_))
        ));
        assert!(matches!(
            parse_paylink_response(r#"{"reducedTx":"AQID","address":"9other"}"#, Some("9addr")),
            Err(Error::AddressMismatch { .. })
        ));
        assert_eq!(reply_body("T1"), r#"{"txId":"T1"}"#);
    }

    #[tokio::test]
    async fn static_request() {
        let http = MockHttp::default();
        let mut flow = PayLinkFlow::new("ergopay:AQID").unwrap();
        let mut rx = flow.subscribe();
        let request = flow.resolve(&http, None).await.unwrap();
        assert_eq!(request.reduced_tx, Some(vec![1, 2, 3]));
        assert_eq!(
            drain(&mut rx),
            vec![PayLinkState::Static, PayLinkState::Resolved]
        );
        assert!(matches!(
            PayLinkFlow::new("https://dapp.example.com"),
            Err(Error::NotPayLink)
        ));
    }

    #[tokio::test]
    async fn dynamic_request_needs_address() {
        let http = MockHttp::default();
        let mut flow = PayLinkFlow::new(DYNAMIC).unwrap();
        assert!(matches!(
            flow.resolve(&http, None).await,
            Err(Error::MissingAddress)
        ));
        assert_eq!(flow.state(), PayLinkState::Error);
        assert!(http.gets.lock().is_empty());
    }

    #[tokio::test]
    async fn network_failure() {
        let http = MockHttp::default();
        let mut flow = PayLinkFlow::new(DYNAMIC).unwrap();
        assert!(matches!(
            flow.resolve(&http, Some("9addr")).await,
            Err(Error::ResolutionFailed(_))
        ));
        assert_eq!(flow.state(), PayLinkState::Error);
        assert_eq!(*http.gets.lock(), vec![FETCH_URL.to_string()]);
        assert!(flow.resolve(&http, Some("9addr")).await.is_err());
    }

    #[tokio::test]
    async fn full_flow_with_reply() {
        let http = MockHttp::default();
        http.responses.lock().insert(
            FETCH_URL.to_string(),
            r#"{"reducedTx":"AQID","address":"9addr","replyTo":"https://dapp.example.com/reply"}"#
                .to_string(),
        );
        let signer = signer();
        let explorer = explorer();

        let mut flow = PayLinkFlow::new(DYNAMIC).unwrap();
        let mut rx = flow.subscribe();
        flow.resolve(&http, Some("9addr")).await.unwrap();

        let preview = flow.build_preview(&explorer, &signer).await.unwrap();
        assert_eq!(preview.summary.id, "tx1");
        assert_eq!(preview.summary.inputs.len(), 1);
        let spent = &preview.summary.inputs[0];
        assert_eq!(spent.value, 100);
        assert_eq!(spent.tokens[0].amount, 3);
        assert_eq!(spent.tokens[0].name.as_deref(), Some("Sigma"));
        assert_eq!(preview.summary.outputs.len(), 2);
        assert_eq!(preview.burned_tokens.len(), 1);
        assert_eq!(preview.burned_tokens[0].amount, 3);

        let signed = flow.sign(&signer, b"key").unwrap();
        assert_eq!(signed, b"signed:\x01\x02\x03");
        flow.submitted("T1").unwrap();
        assert!(flow.send_reply(&http).await.unwrap());
        assert_eq!(flow.state(), PayLinkState::Replied);
        assert_eq!(
            *http.posts.lock(),
            vec![(
                "https://dapp.example.com/reply".to_string(),
                r#"{"txId":"T1"}"#.to_string()
            )]
        );
        assert_eq!(
            drain(&mut rx),
            vec![
                PayLinkState::Fetching,
                PayLinkState::Resolved,
                PayLinkState::AwaitingSignature,
                PayLinkState::Submitted,
                PayLinkState::Replied,
            ]
        );
    }

    #[tokio::test]
    async fn reply_failure_is_swallowed() {
        let http = MockHttp::default();
        *http.fail_posts.lock() = true;
        let mut flow = PayLinkFlow::new("ergopay:AQID").unwrap();
        flow.resolve(&http, None).await.unwrap();
        flow.request.as_mut().unwrap().reply_to = Some("https://dapp.example.com/reply".to_string());
        flow.sign(&MockSigner::default(), b"key").unwrap();
        flow.submitted("T1").unwrap();
        assert!(!flow.send_reply(&http).await.unwrap());
        assert_eq!(flow.state(), PayLinkState::Done);
    }

    #[tokio::test]
    async fn missing_input_box() {
        let http = MockHttp::default();
        let mut signer = signer();
        signer.view.input_box_ids.push("b2".to_string());
        let mut flow = PayLinkFlow::new("ergopay:AQID").unwrap();
        flow.resolve(&http, None).await.unwrap();
        assert!(matches!(
            flow.build_preview(&explorer(), &signer).await,
            Err(Error::IncompleteInputData(id)) if id == "b2"
        ));
        assert_eq!(flow.state(), PayLinkState::Error);
    }

    #[tokio::test]
    async fn cancelled_flow_stays_silent() {
        let http = MockHttp::default();
        let mut flow = PayLinkFlow::new("ergopay:AQID").unwrap();
        let mut rx = flow.subscribe();
        flow.resolve(&http, None).await.unwrap();
        drain(&mut rx);

        flow.canceller().cancel();
        assert!(flow.is_cancelled());
        assert!(matches!(
            flow.sign(&MockSigner::failing(), b"key"),
            Err(Error::InvalidState(_))
        ));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(flow.state(), PayLinkState::Resolved);
    }
}
