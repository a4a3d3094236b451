use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Base64-encoded HMAC-SHA256 of `payload` under `secret`.
pub fn hmac_sha256_base64(secret: &str, payload: &str) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// Verify a base64 HMAC-SHA256 signature using constant-time comparison.
pub fn verify_hmac_sha256_base64(
    secret: &str,
    payload: &str,
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected_signature = hmac_sha256_base64(secret, payload)?;

    let expected_bytes = expected_signature.as_bytes();
    let signature_bytes = signature.trim().as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://payments.example.com/webhooks/square";
    const BODY: &str = r#"{"event_id":"evt-1","type":"invoice.viewed"}"#;

    #[test]
    fn test_signature_generation_and_verification() {
        let payload = format!("{}{}", URL, BODY);
        let signature = hmac_sha256_base64("sig_key", &payload).unwrap();
        assert!(!signature.is_empty());

        assert!(verify_hmac_sha256_base64("sig_key", &payload, &signature).unwrap());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let payload = format!("{}{}", URL, BODY);
        let signature = hmac_sha256_base64("sig_key", &payload).unwrap();

        assert!(!verify_hmac_sha256_base64("other_key", &payload, &signature).unwrap());
    }

    #[test]
    fn test_tampered_body() {
        let signature = hmac_sha256_base64("sig_key", &format!("{}{}", URL, BODY)).unwrap();
        let tampered = format!("{}{}", URL, BODY.replace("viewed", "canceled"));

        assert!(!verify_hmac_sha256_base64("sig_key", &tampered, &signature).unwrap());
    }

    #[test]
    fn test_truncated_signature() {
        let payload = format!("{}{}", URL, BODY);
        let signature = hmac_sha256_base64("sig_key", &payload).unwrap();

        assert!(!verify_hmac_sha256_base64("sig_key", &payload, &signature[1..]).unwrap());
    }
}
