//! AWS Signature Version 4 for form-encoded Query API POSTs.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub(crate) const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

pub(crate) struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

pub(crate) struct SignedHeaders {
    pub amz_date: String,
    pub authorization: String,
}

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Form-encode `params` in the order given (RFC 3986 unreserved set).
pub(crate) fn form_encode(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Sign a `POST /` with `body` against `host` for `service` in `region`.
pub(crate) fn sign_post(
    creds: &Credentials,
    region: &str,
    service: &str,
    host: &str,
    body: &str,
    now: DateTime<Utc>,
) -> SignedHeaders {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let signed_headers = "content-type;host;x-amz-date";
    let canonical_request = format!(
        "POST\n/\n\ncontent-type:{}\nhost:{}\nx-amz-date:{}\n\n{}\n{}",
        CONTENT_TYPE,
        host,
        amz_date,
        signed_headers,
        sha256_hex(body.as_bytes())
    );

    let scope = format!("{}/{}/{}/aws4_request", date, region, service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let k_date = hmac(format!("AWS4{}", creds.secret_key).as_bytes(), &date);
    let k_region = hmac(&k_date, region);
    let k_service = hmac(&k_region, service);
    let k_signing = hmac(&k_service, "aws4_request");
    let signature = hex::encode(hmac(&k_signing, &string_to_sign));

    SignedHeaders {
        amz_date,
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key, scope, signed_headers, signature
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn creds() -> Credentials {
        Credentials {
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
        }
    }

    #[test]
    fn form_encode_escapes_reserved_characters() {
        let body = form_encode(&[
            ("Action".into(), "CreateTags".into()),
            ("Tag.1.Value".into(), r#"{"slug":"a b"}"#.into()),
        ]);
        assert_eq!(
            body,
            "Action=CreateTags&Tag.1.Value=%7B%22slug%22%3A%22a%20b%22%7D"
        );
    }

    const EC2_HOST: &str = "ec2.us-east-1.amazonaws.com";

    #[test]
    fn signature_is_deterministic_and_scoped() {
        let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        let a = sign_post(&creds(), "us-east-1", "ec2", EC2_HOST, "Action=X", now);
        let b = sign_post(&creds(), "us-east-1", "ec2", EC2_HOST, "Action=X", now);
        assert_eq!(a.authorization, b.authorization);
        assert_eq!(a.amz_date, "20150830T123600Z");
        assert!(a.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/ec2/aws4_request, SignedHeaders=content-type;host;x-amz-date, Signature="
        ));
        let sig = a.authorization.rsplit('=').next().unwrap();
        assert_eq!(sig.len(), 64);

        let c = sign_post(&creds(), "us-east-1", "ec2", EC2_HOST, "Action=Y", now);
        assert_ne!(a.authorization, c.authorization);
    }
}
