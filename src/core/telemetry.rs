use tracing_subscriber::{fmt, EnvFilter};

use crate::core::config::Settings;

/// PDF parsing crates log every malformed object at debug level.
const QUIET_DIRECTIVES: &[&str] = &["lopdf=warn", "pdf_extract=warn"];

pub(crate) fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let telemetry = settings.telemetry();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut directives = vec![telemetry.log_level.as_str()];
        directives.extend_from_slice(QUIET_DIRECTIVES);
        EnvFilter::new(directives.join(","))
    });

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    let installed = if telemetry.json {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow::anyhow!("Failed to install tracing subscriber: {err}"))?;

    tracing::debug!(
        environment = settings.runtime().environment.as_str(),
        json = telemetry.json,
        "Tracing initialized"
    );
    Ok(())
}
