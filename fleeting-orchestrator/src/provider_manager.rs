use anyhow::{bail, Context};
use fleeting_providers::FleetProvider;
use std::sync::Arc;

use crate::settings::Settings;

/// Build the provider named by `PROVIDER`. Compiled-out providers are a startup error.
pub fn build_provider(settings: &Settings) -> anyhow::Result<Arc<dyn FleetProvider>> {
    match settings.provider.as_str() {
        "aws" => aws(settings),
        "mock" => mock(),
        other => bail!("unknown provider `{}` (expected aws or mock)", other),
    }
}

#[cfg(feature = "provider-aws")]
fn aws(settings: &Settings) -> anyhow::Result<Arc<dyn FleetProvider>> {
    use fleeting_providers::aws::AwsProvider;

    let access = settings
        .aws
        .access_key_id
        .as_deref()
        .context("environment variable AWS_ACCESS_KEY_ID is not defined")?;
    let secret = settings
        .aws
        .secret_access_key
        .as_deref()
        .context("environment variable AWS_SECRET_ACCESS_KEY is not defined")?;
    let provider = AwsProvider::new(&settings.aws.region, access, secret)
        .context("cannot build AWS client")?;
    tracing::info!(region = %settings.aws.region, "using aws provider");
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "provider-aws"))]
fn aws(_settings: &Settings) -> anyhow::Result<Arc<dyn FleetProvider>> {
    bail!("provider `aws` is not compiled in (enable feature provider-aws)")
}

#[cfg(feature = "provider-mock")]
fn mock() -> anyhow::Result<Arc<dyn FleetProvider>> {
    tracing::warn!("using in-memory mock provider; nothing will be launched");
    Ok(Arc::new(fleeting_providers::mock::MockProvider::new()))
}

#[cfg(not(feature = "provider-mock"))]
fn mock() -> anyhow::Result<Arc<dyn FleetProvider>> {
    bail!("provider `mock` is not compiled in (enable feature provider-mock)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn settings(provider: &str) -> Settings {
        let map: BTreeMap<String, String> = [
            ("PROVIDER", provider),
            ("AWS_KEY_NAME", "k"),
            ("AWS_SECURITY_GROUP", "sg"),
            ("AWS_ACCESS_KEY_ID", "AKID"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Settings::from_lookup(|n| map.get(n).cloned(), map.keys().cloned()).unwrap()
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = build_provider(&settings("gcp")).err().unwrap();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[cfg(feature = "provider-aws")]
    #[test]
    fn aws_provider_builds_from_settings() {
        assert!(build_provider(&settings("aws")).is_ok());
    }
}
