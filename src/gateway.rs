//! Payment gateway client (NOWPayments-compatible)
//!
//! Two concerns live here:
//! - the outbound create-payment call, behind the `PaymentGateway` trait
//!   so tests can substitute a stub
//! - IPN signature verification: HMAC-SHA512 over the exact raw callback
//!   body bytes, hex-encoded, compared in constant time
//!
//! The API key comes from the NOWPAYMENTS_API_KEY environment variable.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Sha512;
use tracing::{info, warn};

use crate::error::{LedgerError, LedgerResult};

type HmacSha512 = Hmac<Sha512>;

/// Get the gateway API key from the environment
fn get_gateway_api_key() -> Option<String> {
    std::env::var("NOWPAYMENTS_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}

/// Request body for the create-payment endpoint
#[derive(Debug, Clone, Serialize)]
pub struct CreatePaymentRequest {
    pub price_amount: f64,
    pub price_currency: String,
    pub pay_currency: String,
    pub order_id: String,
    pub order_description: String,
    pub ipn_callback_url: String,
}

/// Payment details returned by the gateway
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayment {
    #[serde(deserialize_with = "string_or_number")]
    pub payment_id: String,
    pub payment_status: String,
    pub pay_address: String,
    pub pay_amount: f64,
    pub pay_currency: String,
    #[serde(default)]
    pub qrcode_url: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(&self, request: &CreatePaymentRequest)
        -> LedgerResult<GatewayPayment>;
}

pub struct NowPaymentsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl NowPaymentsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let api_key = get_gateway_api_key();
        if api_key.is_some() {
            info!("Payment gateway client initialized with API key");
        } else {
            warn!("Payment gateway client initialized WITHOUT API key - invoice creation will fail");
        }
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl PaymentGateway for NowPaymentsClient {
    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> LedgerResult<GatewayPayment> {
        let url = format!("{}/payment", self.base_url);

        let mut req = self.client.post(&url).json(request);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| LedgerError::Gateway(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Gateway error {}: {}", status, body);
            return Err(LedgerError::Gateway(format!(
                "create payment failed: {}",
                status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| LedgerError::Gateway(e.to_string()))
    }
}

// ============================================================================
// IPN SIGNATURES
// ============================================================================

/// Sign a payload the way the gateway signs its IPN callbacks.
pub fn sign_ipn(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha512::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an IPN signature against the exact raw payload bytes.
/// Constant-time comparison; a malformed hex signature is a mismatch.
pub fn verify_ipn_signature(secret: &[u8], signature_hex: &str, payload: &[u8]) -> bool {
    let sig_bytes = match hex::decode(signature_hex.trim()) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = HmacSha512::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.verify_slice(&sig_bytes).is_ok()
}

/// Gateway ids arrive as either JSON strings or numbers depending on the
/// endpoint; normalize to a string.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let secret = b"ipn-secret";
        let payload = br#"{"payment_id":"123","payment_status":"finished"}"#;

        let sig = sign_ipn(secret, payload);
        assert!(verify_ipn_signature(secret, &sig, payload));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let secret = b"ipn-secret";
        let payload = br#"{"payment_id":"123","payment_status":"finished"}"#;
        let tampered = br#"{"payment_id":"123","payment_status":"waiting"}"#;

        let sig = sign_ipn(secret, payload);
        assert!(!verify_ipn_signature(secret, &sig, tampered));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = b"payload";
        let sig = sign_ipn(b"secret-a", payload);
        assert!(!verify_ipn_signature(b"secret-b", &sig, payload));
    }

    #[test]
    fn test_garbage_signature_rejected() {
        assert!(!verify_ipn_signature(b"secret", "not hex!", b"payload"));
        assert!(!verify_ipn_signature(b"secret", "", b"payload"));
        assert!(!verify_ipn_signature(b"secret", "deadbeef", b"payload"));
    }

    #[test]
    fn test_numeric_payment_id_normalized() {
        let json = r#"{
            "payment_id": 5745356358,
            "payment_status": "waiting",
            "pay_address": "TNDFkiSmBQorNFacb3735q8MnT29sn8BLn",
            "pay_amount": 165.652609,
            "pay_currency": "trx"
        }"#;
        let payment: GatewayPayment = serde_json::from_str(json).unwrap();
        assert_eq!(payment.payment_id, "5745356358");
        assert!(payment.qrcode_url.is_none());
    }
}
