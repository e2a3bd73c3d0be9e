//! Cold wallet signing: the request/response envelopes exchanged between an
//! online wallet and an air-gapped signer, and their QR transport.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    txdetails::{annotate_output_tokens, reduce},
    types::{TransactionSummary, TxBox},
    utils::data_split::{join_chunks, split},
};

use super::{decode_base64, encode_base64, Signer};

pub const QR_TAG_SIGNING_REQUEST: &str = "CSR";
pub const QR_TAG_SIGNED_TX: &str = "CSTX";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningRequest {
    pub reduced_tx: Vec<u8>,
    pub sender: Option<String>,
    /// serialized input boxes, `None` when the signer has to look them up
    pub inputs: Option<Vec<Vec<u8>>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningResponse {
    pub signed_tx: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SigningRequestJson {
    #[serde(rename = "reducedTx")]
    reduced_tx: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inputs: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize)]
struct SigningResponseJson {
    #[serde(rename = "signedTx")]
    signed_tx: Option<String>,
}

fn malformed<E: std::fmt::Display>(what: &'static str) -> impl Fn(E) -> Error {
    move |e| Error::MalformedEnvelope(format!("{what}: {e}"))
}

pub fn encode_signing_request(request: &SigningRequest) -> String {
    let json = SigningRequestJson {
        reduced_tx: Some(encode_base64(&request.reduced_tx)),
        sender: request.sender.clone(),
        inputs: request
            .inputs
            .as_ref()
            .map(|inputs| inputs.iter().map(|i| encode_base64(i)).collect()),
    };
    serde_json::to_string(&json).unwrap_or_default()
}

pub fn decode_signing_request(json: &str) -> Result<SigningRequest> {
    let json: SigningRequestJson =
        serde_json::from_str(json).map_err(malformed("signing request"))?;
    let reduced_tx = json
        .reduced_tx
        .ok_or_else(|| Error::MalformedEnvelope("reducedTx missing".to_string()))?;
    let reduced_tx = decode_base64(&reduced_tx).map_err(malformed("reducedTx"))?;
    let inputs = json
        .inputs
        .map(|inputs| {
            inputs
                .iter()
                .map(|i| decode_base64(i).map_err(malformed("inputs")))
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;
    Ok(SigningRequest {
        reduced_tx,
        sender: json.sender,
        inputs,
    })
}

pub fn encode_signing_response(response: &SigningResponse) -> String {
    let json = SigningResponseJson {
        signed_tx: Some(encode_base64(&response.signed_tx)),
    };
    serde_json::to_string(&json).unwrap_or_default()
}

pub fn decode_signing_response(json: &str) -> Result<SigningResponse> {
    let json: SigningResponseJson =
        serde_json::from_str(json).map_err(malformed("signing response"))?;
    let signed_tx = json
        .signed_tx
        .ok_or_else(|| Error::MalformedEnvelope("signedTx missing".to_string()))?;
    let signed_tx = decode_base64(&signed_tx).map_err(malformed("signedTx"))?;
    Ok(SigningResponse { signed_tx })
}

pub fn signing_request_to_qr_chunks(request: &SigningRequest, size_limit: usize) -> Vec<String> {
    split(&encode_signing_request(request), size_limit, QR_TAG_SIGNING_REQUEST)
}

pub fn signing_request_from_qr_chunks<S: AsRef<str>>(chunks: &[S]) -> Result<SigningRequest> {
    let json = join_chunks(chunks, QR_TAG_SIGNING_REQUEST)?;
    decode_signing_request(&json)
}

pub fn signing_response_to_qr_chunks(response: &SigningResponse, size_limit: usize) -> Vec<String> {
    split(&encode_signing_response(response), size_limit, QR_TAG_SIGNED_TX)
}

pub fn signing_response_from_qr_chunks<S: AsRef<str>>(chunks: &[S]) -> Result<SigningResponse> {
    let json = join_chunks(chunks, QR_TAG_SIGNED_TX)?;
    decode_signing_response(&json)
}

/// Runs on the air-gapped device
pub fn sign_cold_request(
    signer: &dyn Signer,
    request: &SigningRequest,
    key: &[u8],
) -> Result<SigningResponse> {
    let signed_tx = signer
        .sign(&request.reduced_tx, key)
        .map_err(|e| Error::SigningFailed(e.to_string()))?;
    Ok(SigningResponse { signed_tx })
}

/// Netted preview of what a cold signing request spends and issues.
/// Inputs without evidence stay in the preview as bare box ids; evidence
/// the signer cannot read fails the request.
pub fn summary_from_signing_request(
    signer: &dyn Signer,
    request: &SigningRequest,
) -> Result<TransactionSummary> {
    let view = signer
        .inspect(&request.reduced_tx)
        .map_err(|e| Error::MalformedEnvelope(format!("reducedTx: {e}")))?;

    let mut evidence = HashMap::new();
    for (i, serialized) in request.inputs.iter().flatten().enumerate() {
        let input = signer
            .parse_box(serialized)
            .map_err(|e| Error::MalformedEnvelope(format!("inputs[{i}]: {e}")))?;
        if let Some(box_id) = input.box_id.clone() {
            evidence.insert(box_id, input);
        }
    }

    let inputs = view
        .input_box_ids
        .iter()
        .map(|box_id| {
            evidence.remove(box_id).unwrap_or_else(|| TxBox {
                box_id: Some(box_id.clone()),
                ..TxBox::default()
            })
        })
        .collect::<Vec<_>>();
    let outputs = annotate_output_tokens(&inputs, &view.outputs);

    reduce(&TransactionSummary {
        id: view.id,
        inputs,
        outputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{boxed, MockSigner};

    fn request() -> SigningRequest {
        SigningRequest {
            reduced_tx: b"DUMMYDATA".to_vec(),
            sender: Some("ADDRESS".to_string()),
            inputs: Some(vec![b"INPUT1".to_vec()]),
        }
    }

    #[test]
    fn request_round_trip() {
        let r = request();
        assert_eq!(decode_signing_request(&encode_signing_request(&r)).unwrap(), r);

        let bare = SigningRequest {
            reduced_tx: vec![1, 2, 3],
            sender: None,
            inputs: None,
        };
        let json = encode_signing_request(&bare);
        assert_eq!(json, r#"{"reducedTx":"AQID"}"#);
        assert_eq!(decode_signing_request(&json).unwrap(), bare);

        let empty_inputs = SigningRequest {
            inputs: Some(vec![]),
            ..bare
        };
        assert_eq!(
            decode_signing_request(&encode_signing_request(&empty_inputs)).unwrap(),
            empty_inputs
        );
    }

    #[test]
    fn request_needs_reduced_tx() {
        assert!(matches!(
            decode_signing_request(r#"{"sender":"x","inputs":[]}"#),
            Err(Error::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode_signing_request(r#"{"reducedTx":"%%%"}"#),
            Err(Error::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode_signing_request("[]"),
            Err(Error::MalformedEnvelope(_))
        ));
        // null optional fields
        let r = decode_signing_request(r#"{"reducedTx":"YWI=","sender":null}"#).unwrap();
        assert_eq!(r.reduced_tx, b"ab");
        assert_eq!(r.sender, None);
    }

    #[test]
    fn response_round_trip() {
        let r = SigningResponse {
            signed_tx: vec![0xde, 0xad, 0xbe, 0xef],
        };
        assert_eq!(decode_signing_response(&encode_signing_response(&r)).unwrap(), r);
        assert!(matches!(
            decode_signing_response("{}"),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn qr_round_trip() {
        let r = request();
        let many = signing_request_to_qr_chunks(&r, 40);
        let one = signing_request_to_qr_chunks(&r, 50_000_000);
        assert!(many.len() > 1);
        assert_eq!(one.len(), 1);
        assert_eq!(signing_request_from_qr_chunks(&many).unwrap(), r);
        assert_eq!(signing_request_from_qr_chunks(&one).unwrap(), r);

        let response = SigningResponse {
            signed_tx: vec![7; 300],
        };
        let chunks = signing_response_to_qr_chunks(&response, 100);
        assert_eq!(signing_response_from_qr_chunks(&chunks).unwrap(), response);

        // a signed tx is not a signing request
        assert!(matches!(
            signing_request_from_qr_chunks(&chunks),
            Err(Error::ChunkMismatch(_))
        ));
    }

    #[test]
    fn signer_failure() {
        let signer = MockSigner::failing();
        assert!(matches!(
            sign_cold_request(&signer, &request(), b"key"),
            Err(Error::SigningFailed(_))
        ));
        let signer = MockSigner::default();
        let response = sign_cold_request(&signer, &request(), b"key").unwrap();
        assert_eq!(response.signed_tx, b"signed:DUMMYDATA");
    }

    #[test]
    fn summary_inputs_and_evidence() {
        let mut signer = MockSigner::default();
        signer.view.id = "tx1".to_string();
        signer.view.input_box_ids = vec!["b1".to_string(), "b2".to_string()];
        signer.view.outputs = vec![boxed(None, "A", 990, &[]), boxed(None, "B", 10, &[])];
        signer.boxes.insert(b"E1".to_vec(), boxed(Some("b1"), "A", 1000, &[]));

        let mut request = SigningRequest {
            reduced_tx: b"tx".to_vec(),
            sender: None,
            inputs: Some(vec![b"E1".to_vec(), b"garbage".to_vec()]),
        };
        match summary_from_signing_request(&signer, &request) {
            Err(Error::MalformedEnvelope(e)) => assert!(e.starts_with("inputs[1]")),
            other => panic!("unexpected {other:?}"),
        }

        // b2 has no evidence at all
        request.inputs = Some(vec![b"E1".to_vec()]);
        let summary = summary_from_signing_request(&signer, &request).unwrap();
        assert_eq!(summary.id, "tx1");
        assert_eq!(summary.inputs.len(), 2);
        assert_eq!(summary.inputs[0].address.as_deref(), Some("A"));
        assert_eq!(summary.inputs[0].value, 10);
        assert_eq!(summary.inputs[1].address, None);
        assert_eq!(summary.inputs[1].box_id.as_deref(), Some("b2"));
        assert_eq!(summary.outputs, vec![boxed(None, "B", 10, &[])]);
    }
}
