//! Gateway wire protocol: canonical parameter string, HMAC-SHA512 signatures,
//! outbound payment URLs and inbound callback parsing.
//!
//! The canonical string is the byte-exact contract with the gateway: non-empty
//! parameters sorted by key, each rendered as `key=value` with form encoding
//! (RFC 3986 percent-encoding, space as `+`), joined by `&` with no trailing
//! separator.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use tourline_shared::Masked;

use crate::{CoreError, CoreResult};

type HmacSha512 = Hmac<Sha512>;

pub const SECURE_HASH: &str = "vnp_SecureHash";
pub const SECURE_HASH_TYPE: &str = "vnp_SecureHashType";
pub const SUCCESS_CODE: &str = "00";

/// Gateway amounts are integers in 1/100 of the currency unit.
const AMOUNT_SCALE: i64 = 100;
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewaySettings {
    pub gateway_id: String,
    pub pay_url: String,
    pub tmn_code: String,
    pub hash_secret: Masked<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_locale")]
    pub locale: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
}

fn default_version() -> String { "2.1.0".to_string() }
fn default_locale() -> String { "vn".to_string() }
fn default_currency() -> String { "VND".to_string() }
fn default_utc_offset_hours() -> i32 { 7 }

impl GatewaySettings {
    fn offset(&self) -> CoreResult<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).ok_or_else(|| {
            CoreError::InvalidArgument(format!("invalid utc offset {}", self.utc_offset_hours))
        })
    }

    pub fn format_timestamp(&self, at: DateTime<Utc>) -> CoreResult<String> {
        Ok(at.with_timezone(&self.offset()?).format(TIMESTAMP_FORMAT).to_string())
    }
}

fn encode(value: &str) -> String {
    urlencoding::encode(value).replace("%20", "+")
}

/// Canonical signing string over every non-empty parameter, sorted by key.
pub fn canonical_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

pub struct GatewaySigner {
    secret: Masked<String>,
}

impl GatewaySigner {
    pub fn new(secret: Masked<String>) -> Self {
        Self { secret }
    }

    fn mac(&self) -> HmacSha512 {
        // HMAC accepts keys of any length.
        HmacSha512::new_from_slice(self.secret.expose().as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"))
    }

    /// Lowercase hex HMAC-SHA512 of the canonical string.
    pub fn sign(&self, params: &BTreeMap<String, String>) -> String {
        let mut mac = self.mac();
        mac.update(canonical_string(params).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Strip the signature fields, rebuild the canonical string and compare the
    /// recomputed MAC with the supplied one in constant time.
    pub fn verify(&self, params: &HashMap<String, String>) -> bool {
        let Some(supplied) = params.get(SECURE_HASH) else {
            return false;
        };
        let Ok(supplied) = hex::decode(supplied.trim()) else {
            return false;
        };

        let signed: BTreeMap<String, String> = params
            .iter()
            .filter(|(key, _)| key.as_str() != SECURE_HASH && key.as_str() != SECURE_HASH_TYPE)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut mac = self.mac();
        mac.update(canonical_string(&signed).as_bytes());
        mac.verify_slice(&supplied).is_ok()
    }
}

/// Convert a currency amount to the gateway's scaled integer form.
pub fn to_gateway_amount(amount: Decimal) -> CoreResult<i64> {
    let scaled = amount * Decimal::from(AMOUNT_SCALE);
    if scaled.fract() != Decimal::ZERO {
        return Err(CoreError::InvalidArgument(format!(
            "amount {} has more precision than the gateway supports",
            amount
        )));
    }
    scaled
        .to_i64()
        .ok_or_else(|| CoreError::InvalidArgument(format!("amount {} out of range", amount)))
}

pub fn from_gateway_amount(scaled: i64) -> Decimal {
    Decimal::from(scaled) / Decimal::from(AMOUNT_SCALE)
}

/// Everything needed to render one signed redirect URL.
#[derive(Debug, Clone)]
pub struct PaymentRequestParams<'a> {
    pub internal_code: &'a str,
    pub amount: Decimal,
    pub order_info: String,
    pub return_url: &'a str,
    pub client_ip: &'a str,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub fn build_payment_url(
    settings: &GatewaySettings,
    signer: &GatewaySigner,
    request: &PaymentRequestParams<'_>,
) -> CoreResult<String> {
    let mut params = BTreeMap::new();
    params.insert("vnp_Version".to_string(), settings.version.clone());
    params.insert("vnp_Command".to_string(), "pay".to_string());
    params.insert("vnp_TmnCode".to_string(), settings.tmn_code.clone());
    params.insert("vnp_Amount".to_string(), to_gateway_amount(request.amount)?.to_string());
    params.insert("vnp_CurrCode".to_string(), settings.currency.clone());
    params.insert("vnp_TxnRef".to_string(), request.internal_code.to_string());
    params.insert("vnp_OrderInfo".to_string(), request.order_info.clone());
    params.insert("vnp_OrderType".to_string(), "other".to_string());
    params.insert("vnp_Locale".to_string(), settings.locale.clone());
    params.insert("vnp_ReturnUrl".to_string(), request.return_url.to_string());
    params.insert("vnp_IpAddr".to_string(), request.client_ip.to_string());
    params.insert("vnp_CreateDate".to_string(), settings.format_timestamp(request.created_at)?);
    params.insert("vnp_ExpireDate".to_string(), settings.format_timestamp(request.expires_at)?);

    let signature = signer.sign(&params);
    Ok(format!(
        "{}?{}&{}={}",
        settings.pay_url,
        canonical_string(&params),
        SECURE_HASH,
        signature
    ))
}

/// The fields of an inbound gateway notification the reconciler acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayCallback {
    pub internal_code: String,
    pub amount: Decimal,
    pub response_code: String,
    pub transaction_status: Option<String>,
    pub gateway_reference: Option<String>,
}

impl GatewayCallback {
    pub fn from_params(params: &HashMap<String, String>) -> CoreResult<Self> {
        let field = |name: &str| {
            params
                .get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| CoreError::InvalidArgument(format!("missing {}", name)))
        };

        let raw_amount = field("vnp_Amount")?;
        let scaled: i64 = raw_amount
            .parse()
            .map_err(|_| CoreError::InvalidArgument(format!("malformed vnp_Amount '{}'", raw_amount)))?;

        Ok(Self {
            internal_code: field("vnp_TxnRef")?,
            amount: from_gateway_amount(scaled),
            response_code: field("vnp_ResponseCode")?,
            transaction_status: params.get("vnp_TransactionStatus").filter(|v| !v.is_empty()).cloned(),
            gateway_reference: params.get("vnp_TransactionNo").filter(|v| !v.is_empty()).cloned(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code == SUCCESS_CODE
            && self.transaction_status.as_deref().map_or(true, |s| s == SUCCESS_CODE)
    }
}

/// Acknowledgement body in the gateway's own vocabulary for server-to-server
/// notifications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayAck {
    #[serde(rename = "RspCode")]
    pub rsp_code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl GatewayAck {
    fn new(code: &str, message: &str) -> Self {
        Self {
            rsp_code: code.to_string(),
            message: message.to_string(),
        }
    }

    pub fn confirmed() -> Self { Self::new("00", "Confirm Success") }
    pub fn order_not_found() -> Self { Self::new("01", "Order not found") }
    pub fn already_confirmed() -> Self { Self::new("02", "Order already confirmed") }
    pub fn invalid_amount() -> Self { Self::new("04", "Invalid amount") }
    pub fn invalid_signature() -> Self { Self::new("97", "Invalid signature") }
    pub fn unknown_error() -> Self { Self::new("99", "Unknown error") }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_params() -> BTreeMap<String, String> {
        [
            ("vnp_Amount", "150000000"),
            ("vnp_Command", "pay"),
            ("vnp_CreateDate", "20261018103000"),
            ("vnp_CurrCode", "VND"),
            ("vnp_ExpireDate", "20261018104500"),
            ("vnp_IpAddr", "127.0.0.1"),
            ("vnp_Locale", "vn"),
            ("vnp_OrderInfo", "Payment for booking 42"),
            ("vnp_OrderType", "other"),
            ("vnp_ReturnUrl", "https://tourline.example/payments/return"),
            ("vnp_TmnCode", "TOURLINE"),
            ("vnp_TxnRef", "abc-123"),
            ("vnp_Version", "2.1.0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn signer() -> GatewaySigner {
        GatewaySigner::new(Masked::new("SECRETKEY".to_string()))
    }

    #[test]
    fn test_canonical_string_is_sorted_and_form_encoded() {
        let canonical = canonical_string(&sample_params());
        assert_eq!(
            canonical,
            "vnp_Amount=150000000&vnp_Command=pay&vnp_CreateDate=20261018103000&vnp_CurrCode=VND\
             &vnp_ExpireDate=20261018104500&vnp_IpAddr=127.0.0.1&vnp_Locale=vn\
             &vnp_OrderInfo=Payment+for+booking+42&vnp_OrderType=other\
             &vnp_ReturnUrl=https%3A%2F%2Ftourline.example%2Fpayments%2Freturn\
             &vnp_TmnCode=TOURLINE&vnp_TxnRef=abc-123&vnp_Version=2.1.0"
        );
        assert!(!canonical.ends_with('&'));
    }

    #[test]
    fn test_signature_matches_reference_vector() {
        assert_eq!(
            signer().sign(&sample_params()),
            "9e7e11e80759cc5edf54251c272aa7e660205759cace738cfab1c96826885640\
             d3c46cfe9e381f30431485b9af312deff4c01b154b52e0f45d9f514867327441"
        );
    }

    #[test]
    fn test_empty_values_are_not_signed() {
        let mut with_empty = sample_params();
        with_empty.insert("vnp_BankCode".to_string(), String::new());
        assert_eq!(canonical_string(&with_empty), canonical_string(&sample_params()));
    }

    #[test]
    fn test_verify_accepts_own_signature_and_rejects_tampering() {
        let signer = signer();
        let params = sample_params();
        let mut inbound: HashMap<String, String> = params.clone().into_iter().collect();
        inbound.insert(SECURE_HASH.to_string(), signer.sign(&params));
        inbound.insert(SECURE_HASH_TYPE.to_string(), "HmacSHA512".to_string());
        assert!(signer.verify(&inbound));

        for key in ["vnp_Amount", "vnp_TxnRef", "vnp_OrderInfo", "vnp_Locale"] {
            let mut tampered = inbound.clone();
            tampered.insert(key.to_string(), format!("{}0", tampered[key]));
            assert!(!signer.verify(&tampered), "tampering {} went unnoticed", key);
        }

        let mut extra = inbound.clone();
        extra.insert("vnp_BankCode".to_string(), "NCB".to_string());
        assert!(!signer.verify(&extra));

        let mut missing = inbound.clone();
        missing.remove(SECURE_HASH);
        assert!(!signer.verify(&missing));

        let mut garbage = inbound;
        garbage.insert(SECURE_HASH.to_string(), "not-hex".to_string());
        assert!(!signer.verify(&garbage));
    }

    #[test]
    fn test_other_secret_does_not_verify() {
        let params = sample_params();
        let mut inbound: HashMap<String, String> = params.clone().into_iter().collect();
        inbound.insert(SECURE_HASH.to_string(), signer().sign(&params));

        let other = GatewaySigner::new(Masked::new("OTHERKEY".to_string()));
        assert!(!other.verify(&inbound));
    }

    #[test]
    fn test_amount_scaling() {
        assert_eq!(to_gateway_amount(Decimal::new(1_500_000, 0)).unwrap(), 150_000_000);
        assert_eq!(to_gateway_amount(Decimal::new(1050, 2)).unwrap(), 1050);
        assert!(to_gateway_amount(Decimal::new(1001, 3)).is_err());
        assert_eq!(from_gateway_amount(150_000_000), Decimal::new(1_500_000, 0));
    }

    #[test]
    fn test_payment_url_embeds_local_timestamps_and_signature() {
        let settings = GatewaySettings {
            gateway_id: "vnpay".to_string(),
            pay_url: "https://sandbox.gateway.example/paymentv2/vpcpay.html".to_string(),
            tmn_code: "TOURLINE".to_string(),
            hash_secret: Masked::new("SECRETKEY".to_string()),
            version: default_version(),
            locale: default_locale(),
            currency: default_currency(),
            utc_offset_hours: 7,
        };
        let created = Utc.with_ymd_and_hms(2026, 10, 18, 3, 30, 0).unwrap();
        let request = PaymentRequestParams {
            internal_code: "abc-123",
            amount: Decimal::new(1_500_000, 0),
            order_info: "Payment for booking 42".to_string(),
            return_url: "https://tourline.example/payments/return",
            client_ip: "127.0.0.1",
            created_at: created,
            expires_at: created + chrono::Duration::minutes(15),
        };

        let url = build_payment_url(&settings, &signer(), &request).unwrap();
        let expected_query = canonical_string(&sample_params());
        assert!(url.starts_with("https://sandbox.gateway.example/paymentv2/vpcpay.html?"));
        assert!(url.contains(&expected_query));
        assert!(url.ends_with(&format!("{}={}", SECURE_HASH, signer().sign(&sample_params()))));
    }

    #[test]
    fn test_callback_parsing() {
        let mut params = HashMap::new();
        params.insert("vnp_TxnRef".to_string(), "abc-123".to_string());
        params.insert("vnp_Amount".to_string(), "150000000".to_string());
        params.insert("vnp_ResponseCode".to_string(), "00".to_string());
        params.insert("vnp_TransactionStatus".to_string(), "00".to_string());
        params.insert("vnp_TransactionNo".to_string(), "14012345".to_string());

        let callback = GatewayCallback::from_params(&params).unwrap();
        assert_eq!(callback.amount, Decimal::new(1_500_000, 0));
        assert!(callback.is_success());
        assert_eq!(callback.gateway_reference.as_deref(), Some("14012345"));

        params.insert("vnp_TransactionStatus".to_string(), "02".to_string());
        assert!(!GatewayCallback::from_params(&params).unwrap().is_success());

        params.insert("vnp_Amount".to_string(), "lots".to_string());
        assert!(matches!(
            GatewayCallback::from_params(&params),
            Err(CoreError::InvalidArgument(_))
        ));
    }
}
