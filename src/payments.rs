//! Payment orders and webhook reconciliation.
//!
//! An invoice is created synchronously against the gateway and persisted
//! before pay-address details are returned; the asynchronous, signed
//! status notification arrives later on the webhook path and is joined to
//! the order only by `gateway_invoice_id`. An order already in a terminal
//! state acknowledges any further notification without changing state or
//! balances, which makes the webhook safe under retries and out-of-order
//! delivery.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::gateway::{self, CreatePaymentRequest, PaymentGateway};
use crate::storage::AirdropStorage;

/// Dpower credited per purchased USD.
pub const DPOWER_PER_USD: i64 = 2000;

/// Minimum purchase, also the granularity (multiples of $5).
pub const MIN_USD_AMOUNT: i64 = 5;

// ============================================================================
// ORDER STATE
// ============================================================================

/// Gateway-reported order states. `finished` is the only state that
/// credits; the terminal set below is the webhook idempotence boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Waiting,
    Confirming,
    Confirmed,
    Sending,
    Finished,
    Failed,
    Expired,
    Refunded,
    ReverseResolved,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::Waiting => "waiting",
            PaymentStatus::Confirming => "confirming",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Sending => "sending",
            PaymentStatus::Finished => "finished",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::ReverseResolved => "reverse_resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(PaymentStatus::Created),
            "waiting" => Some(PaymentStatus::Waiting),
            "confirming" => Some(PaymentStatus::Confirming),
            "confirmed" => Some(PaymentStatus::Confirmed),
            "sending" => Some(PaymentStatus::Sending),
            "finished" => Some(PaymentStatus::Finished),
            "failed" => Some(PaymentStatus::Failed),
            "expired" => Some(PaymentStatus::Expired),
            "refunded" => Some(PaymentStatus::Refunded),
            "reverse_resolved" => Some(PaymentStatus::ReverseResolved),
            _ => None,
        }
    }

    /// Terminal states never transition again and never re-credit.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Finished
                | PaymentStatus::Failed
                | PaymentStatus::Expired
                | PaymentStatus::Refunded
                | PaymentStatus::ReverseResolved
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentOrder {
    pub id: String,
    pub user_id: String,
    pub gateway_invoice_id: String,
    pub status: PaymentStatus,
    pub amount_usd: i64,
    pub dpower_to_credit: i64,
    pub pay_currency: Option<String>,
    pub pay_address: Option<String>,
    pub pay_amount: Option<f64>,
    /// Raw notification payload retained for audit.
    pub webhook_payload: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPaymentOrder {
    pub user_id: String,
    pub gateway_invoice_id: String,
    pub status: PaymentStatus,
    pub amount_usd: i64,
    pub dpower_to_credit: i64,
    pub pay_currency: Option<String>,
    pub pay_address: Option<String>,
    pub pay_amount: Option<f64>,
}

/// Typed IPN payload. Required fields missing or an unknown status string
/// fail the parse, so malformed input is rejected before it reaches
/// ledger state.
#[derive(Debug, Clone, Deserialize)]
pub struct IpnPayload {
    #[serde(deserialize_with = "gateway::string_or_number")]
    pub payment_id: String,
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub pay_address: Option<String>,
    #[serde(default)]
    pub pay_amount: Option<f64>,
    #[serde(default)]
    pub actually_paid: Option<f64>,
    #[serde(default)]
    pub pay_currency: Option<String>,
    #[serde(default)]
    pub outcome_amount: Option<f64>,
}

/// What a verified notification did to its order.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// Duplicate or late retry of a terminal order: acknowledged, nothing
    /// changed.
    AlreadyFinal { status: PaymentStatus },
    /// Non-terminal progress update recorded.
    StatusUpdated { status: PaymentStatus },
    /// Finished: Dpower credited exactly once.
    Credited {
        user_id: String,
        dpower_credited: i64,
    },
    /// Finished but the owning user is gone; order flipped to failed.
    CreditFailedUserMissing,
}

/// Invoice details returned to the purchasing user.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDetails {
    pub wallet_address: Option<String>,
    pub crypto_amount: Option<f64>,
    pub crypto_currency: Option<String>,
    pub gateway_invoice_id: String,
    pub qrcode_url: Option<String>,
}

// ============================================================================
// SERVICE
// ============================================================================

#[derive(Clone)]
pub struct PaymentService {
    storage: Arc<AirdropStorage>,
    gateway: Arc<dyn PaymentGateway>,
    ipn_secret: Option<String>,
    callback_url: String,
}

impl PaymentService {
    pub fn new(
        storage: Arc<AirdropStorage>,
        gateway: Arc<dyn PaymentGateway>,
        ipn_secret: Option<String>,
        callback_url: String,
    ) -> Self {
        if ipn_secret.is_none() {
            warn!("IPN secret not configured - webhook notifications will be rejected");
        }
        Self {
            storage,
            gateway,
            ipn_secret,
            callback_url,
        }
    }

    /// Create a purchase invoice with the gateway and persist the order
    /// before returning pay-address details. The webhook later joins back
    /// on `gateway_invoice_id`.
    pub async fn create_invoice(
        &self,
        user_id: &str,
        usd_amount: i64,
        pay_currency: &str,
    ) -> LedgerResult<InvoiceDetails> {
        if usd_amount < MIN_USD_AMOUNT || usd_amount % MIN_USD_AMOUNT != 0 {
            return Err(LedgerError::InvalidAmount(
                "Please enter a valid USD amount (minimum $5, in multiples of $5).".to_string(),
            ));
        }
        if pay_currency.trim().is_empty() {
            return Err(LedgerError::InvalidAmount(
                "Please select a cryptocurrency.".to_string(),
            ));
        }

        let user = self
            .storage
            .user_by_id(user_id)?
            .ok_or(LedgerError::UserNotFound)?;
        if user.is_blocked {
            return Err(LedgerError::AccountBlocked);
        }

        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        let order_id = format!(
            "DPOWER_{}_{}_{}",
            user.id,
            Utc::now().timestamp_millis(),
            suffix.to_lowercase()
        );

        let request = CreatePaymentRequest {
            price_amount: usd_amount as f64,
            price_currency: "usd".to_string(),
            pay_currency: pay_currency.trim().to_lowercase(),
            order_id,
            order_description: format!("Dpower purchase for {} USD", usd_amount),
            ipn_callback_url: self.callback_url.clone(),
        };

        let payment = self.gateway.create_payment(&request).await?;

        // Persist before returning details; unknown gateway status strings
        // default to waiting (the gateway owns its vocabulary, we only act
        // on the states we know).
        let status = PaymentStatus::parse(&payment.payment_status).unwrap_or(PaymentStatus::Waiting);
        let order = self.storage.insert_payment_order(&NewPaymentOrder {
            user_id: user.id.clone(),
            gateway_invoice_id: payment.payment_id.clone(),
            status,
            amount_usd: usd_amount,
            dpower_to_credit: usd_amount * DPOWER_PER_USD,
            pay_currency: Some(payment.pay_currency.clone()),
            pay_address: Some(payment.pay_address.clone()),
            pay_amount: Some(payment.pay_amount),
        })?;

        info!(
            "Created payment order {} for user {} ({} USD -> {} Dpower)",
            order.gateway_invoice_id, user.username, usd_amount, order.dpower_to_credit
        );

        Ok(InvoiceDetails {
            wallet_address: order.pay_address,
            crypto_amount: order.pay_amount,
            crypto_currency: order.pay_currency,
            gateway_invoice_id: order.gateway_invoice_id,
            qrcode_url: payment.qrcode_url,
        })
    }

    /// Handle a gateway status notification.
    ///
    /// Order of checks: signature over the exact raw bytes first, then
    /// the typed parse, then the order lookup; only then does any state
    /// change. Safe to invoke arbitrarily many times for the same event.
    pub fn handle_notification(
        &self,
        signature: Option<&str>,
        raw: &[u8],
    ) -> LedgerResult<WebhookOutcome> {
        let secret = self
            .ipn_secret
            .as_deref()
            .ok_or(LedgerError::InvalidSignature)?;
        let signature = signature.ok_or(LedgerError::InvalidSignature)?;

        if !gateway::verify_ipn_signature(secret.as_bytes(), signature, raw) {
            warn!("Payment webhook rejected: invalid signature");
            return Err(LedgerError::InvalidSignature);
        }

        let payload: IpnPayload =
            serde_json::from_slice(raw).map_err(|_| LedgerError::InvalidPayload)?;
        let raw_text = String::from_utf8_lossy(raw);

        let outcome = self
            .storage
            .apply_payment_notification(&payload.payment_id, payload.payment_status, &raw_text)
            .map_err(|e| {
                if matches!(e, LedgerError::OrderNotFound) {
                    // Not retried: logged and dropped.
                    warn!(
                        "Payment webhook: no order for invoice id {}",
                        payload.payment_id
                    );
                }
                e
            })?;

        match &outcome {
            WebhookOutcome::AlreadyFinal { status } => {
                info!(
                    "Payment {} already in final status {}; skipping",
                    payload.payment_id,
                    status.as_str()
                );
            }
            WebhookOutcome::StatusUpdated { status } => {
                info!(
                    "Payment {} moved to status {}",
                    payload.payment_id,
                    status.as_str()
                );
            }
            WebhookOutcome::Credited {
                user_id,
                dpower_credited,
            } => {
                info!(
                    "User {} credited {} Dpower from payment {}",
                    user_id, dpower_credited, payload.payment_id
                );
            }
            WebhookOutcome::CreditFailedUserMissing => {}
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::gateway::GatewayPayment;
    use crate::storage::NewUser;
    use async_trait::async_trait;

    struct StubGateway;

    #[async_trait]
    impl PaymentGateway for StubGateway {
        async fn create_payment(
            &self,
            request: &CreatePaymentRequest,
        ) -> LedgerResult<GatewayPayment> {
            Ok(GatewayPayment {
                payment_id: "5745356358".to_string(),
                payment_status: "waiting".to_string(),
                pay_address: "TNDFkiSmBQorNFacb3735q8MnT29sn8BLn".to_string(),
                pay_amount: request.price_amount * 33.0,
                pay_currency: request.pay_currency.clone(),
                qrcode_url: None,
            })
        }
    }

    const SECRET: &str = "test-ipn-secret";

    fn service() -> (Arc<AirdropStorage>, PaymentService, String) {
        let storage = Arc::new(AirdropStorage::in_memory().unwrap());
        let user = storage
            .create_user(&NewUser {
                username: "buyer".to_string(),
                email: "buyer@example.com".to_string(),
                referred_by: None,
            })
            .unwrap();
        let service = PaymentService::new(
            storage.clone(),
            Arc::new(StubGateway),
            Some(SECRET.to_string()),
            "http://localhost:8080/api/airdrop/webhook/nowpayments".to_string(),
        );
        (storage, service, user.id)
    }

    fn signed(body: &str) -> String {
        gateway::sign_ipn(SECRET.as_bytes(), body.as_bytes())
    }

    fn finished_body(invoice_id: &str) -> String {
        format!(
            r#"{{"payment_id":"{invoice_id}","payment_status":"finished","pay_currency":"trx","actually_paid":165.65}}"#
        )
    }

    #[test]
    fn test_invoice_amount_validation() {
        let (_storage, service, user_id) = service();
        for bad in [0, 3, 7, -5, 4] {
            let err = tokio_test::block_on(service.create_invoice(&user_id, bad, "trx"))
                .unwrap_err();
            assert!(matches!(err, LedgerError::InvalidAmount(_)), "{bad}");
        }
        let err =
            tokio_test::block_on(service.create_invoice(&user_id, 5, "  ")).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
    }

    #[test]
    fn test_invoice_persists_order_before_returning() {
        let (storage, service, user_id) = service();

        let details =
            tokio_test::block_on(service.create_invoice(&user_id, 5, "TRX")).unwrap();
        assert_eq!(details.gateway_invoice_id, "5745356358");

        let order = storage
            .payment_order_by_invoice("5745356358")
            .unwrap()
            .unwrap();
        assert_eq!(order.user_id, user_id);
        assert_eq!(order.amount_usd, 5);
        assert_eq!(order.dpower_to_credit, 5 * DPOWER_PER_USD);
        assert_eq!(order.status, PaymentStatus::Waiting);
    }

    #[test]
    fn test_finished_notification_credits_exactly_once() {
        let (storage, service, user_id) = service();
        tokio_test::block_on(service.create_invoice(&user_id, 5, "trx")).unwrap();

        let body = finished_body("5745356358");
        let sig = signed(&body);

        let outcome = service
            .handle_notification(Some(&sig), body.as_bytes())
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Credited {
                user_id: user_id.clone(),
                dpower_credited: 10_000,
            }
        );

        // Redelivery acknowledges with zero additional state change.
        let outcome = service
            .handle_notification(Some(&sig), body.as_bytes())
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::AlreadyFinal {
                status: PaymentStatus::Finished
            }
        );

        let user = storage.user_by_id(&user_id).unwrap().unwrap();
        assert_eq!(user.dpower_balance, 10_000);
    }

    #[test]
    fn test_late_progress_update_after_terminal_is_noop() {
        let (storage, service, user_id) = service();
        tokio_test::block_on(service.create_invoice(&user_id, 5, "trx")).unwrap();

        let body = finished_body("5745356358");
        service
            .handle_notification(Some(&signed(&body)), body.as_bytes())
            .unwrap();

        // An out-of-order "confirming" retry arriving after the terminal
        // state must change nothing.
        let late = r#"{"payment_id":"5745356358","payment_status":"confirming"}"#;
        let outcome = service
            .handle_notification(Some(&signed(late)), late.as_bytes())
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::AlreadyFinal {
                status: PaymentStatus::Finished
            }
        );

        let order = storage
            .payment_order_by_invoice("5745356358")
            .unwrap()
            .unwrap();
        assert_eq!(order.status, PaymentStatus::Finished);
    }

    #[test]
    fn test_progress_updates_before_terminal() {
        let (storage, service, user_id) = service();
        tokio_test::block_on(service.create_invoice(&user_id, 10, "trx")).unwrap();

        let body = r#"{"payment_id":"5745356358","payment_status":"confirming"}"#;
        let outcome = service
            .handle_notification(Some(&signed(body)), body.as_bytes())
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::StatusUpdated {
                status: PaymentStatus::Confirming
            }
        );

        // No credit yet.
        let user = storage.user_by_id(&user_id).unwrap().unwrap();
        assert_eq!(user.dpower_balance, 0);
    }

    #[test]
    fn test_invalid_signature_rejected_without_state_change() {
        let (storage, service, user_id) = service();
        tokio_test::block_on(service.create_invoice(&user_id, 5, "trx")).unwrap();

        let body = finished_body("5745356358");

        let err = service
            .handle_notification(Some("deadbeef"), body.as_bytes())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSignature));

        let err = service.handle_notification(None, body.as_bytes()).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSignature));

        let user = storage.user_by_id(&user_id).unwrap().unwrap();
        assert_eq!(user.dpower_balance, 0);
        let order = storage
            .payment_order_by_invoice("5745356358")
            .unwrap()
            .unwrap();
        assert_eq!(order.status, PaymentStatus::Waiting);
    }

    #[test]
    fn test_unknown_order_is_dropped() {
        let (_storage, service, _user_id) = service();
        let body = finished_body("999999");
        let err = service
            .handle_notification(Some(&signed(&body)), body.as_bytes())
            .unwrap_err();
        assert!(matches!(err, LedgerError::OrderNotFound));
    }

    #[test]
    fn test_unknown_status_rejected_before_state_change() {
        let (storage, service, user_id) = service();
        tokio_test::block_on(service.create_invoice(&user_id, 5, "trx")).unwrap();

        let body = r#"{"payment_id":"5745356358","payment_status":"partially_paid"}"#;
        let err = service
            .handle_notification(Some(&signed(body)), body.as_bytes())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidPayload));

        let order = storage
            .payment_order_by_invoice("5745356358")
            .unwrap()
            .unwrap();
        assert_eq!(order.status, PaymentStatus::Waiting);
    }

    #[test]
    fn test_missing_user_flips_order_to_failed() {
        let (storage, service, user_id) = service();
        tokio_test::block_on(service.create_invoice(&user_id, 5, "trx")).unwrap();
        storage.delete_user(&user_id).unwrap();

        let body = finished_body("5745356358");
        let outcome = service
            .handle_notification(Some(&signed(&body)), body.as_bytes())
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::CreditFailedUserMissing);

        let order = storage
            .payment_order_by_invoice("5745356358")
            .unwrap()
            .unwrap();
        assert_eq!(order.status, PaymentStatus::Failed);
        assert!(order.message.unwrap().contains("not credited"));
    }
}
