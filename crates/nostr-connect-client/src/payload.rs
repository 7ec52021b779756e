use crate::encryption::{decrypt, encrypt, EncryptionContext};
use crate::{Error, Method, RequestPayload, ResponsePayload, Result};

pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Build a request, generating an id when the caller supplies none.
pub fn build_request(id: Option<String>, method: Method, params: Vec<String>) -> RequestPayload {
    RequestPayload {
        id: id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_request_id),
        method,
        params,
    }
}

pub fn encode_request(request: &RequestPayload, ctx: &EncryptionContext) -> Result<String> {
    let json = serde_json::to_string(request).map_err(|e| Error::Encode(e.to_string()))?;
    encrypt(&json, ctx)
}

pub fn encode_response(response: &ResponsePayload, ctx: &EncryptionContext) -> Result<String> {
    let json = serde_json::to_string(response).map_err(|e| Error::Encode(e.to_string()))?;
    encrypt(&json, ctx)
}

pub fn decode_request(ciphertext: &str, ctx: &EncryptionContext) -> Result<RequestPayload> {
    let plaintext = decrypt(ciphertext, ctx)?;
    let request: RequestPayload =
        serde_json::from_str(&plaintext).map_err(|e| Error::UnexpectedPayload(e.to_string()))?;
    if request.id.is_empty() {
        return Err(Error::UnexpectedPayload(
            "request id must be a non-empty string".to_string(),
        ));
    }
    Ok(request)
}

pub fn decode_response(ciphertext: &str, ctx: &EncryptionContext) -> Result<ResponsePayload> {
    let plaintext = decrypt(ciphertext, ctx)?;
    let response: ResponsePayload =
        serde_json::from_str(&plaintext).map_err(|e| Error::UnexpectedPayload(e.to_string()))?;
    if response.id.is_empty() {
        return Err(Error::UnexpectedPayload(
            "response id must be a non-empty string".to_string(),
        ));
    }
    Ok(response)
}
