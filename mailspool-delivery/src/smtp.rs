//! SMTP relay transport built on lettre.

use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    address::Envelope,
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
        extension::ClientId,
    },
};
use mailspool_common::{internal, outgoing};
use mailspool_tracing::traced;
use serde::Deserialize;

use crate::{
    error::{DeliveryError, PermanentError, SystemError, TemporaryError},
    message::OutboundMessage,
    transport::MailTransport,
};

/// Relay connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// Relay host name
    ///
    /// Default: `localhost`
    #[serde(default = "defaults::host")]
    pub host: String,

    /// Default: 25
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Timeout applied to connecting and to each SMTP command (in milliseconds)
    ///
    /// Default: 10000 (10 seconds)
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Connect over implicit TLS (SMTPS)
    #[serde(default)]
    pub ssl: bool,

    /// Require a STARTTLS upgrade before sending
    #[serde(default)]
    pub starttls: bool,

    /// Name announced in EHLO, the local host name if unset
    #[serde(default)]
    pub hello_name: Option<String>,

    /// Log each envelope and the relay's response
    #[serde(default)]
    pub debug: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: defaults::host(),
            port: defaults::port(),
            timeout_ms: defaults::timeout_ms(),
            username: None,
            password: None,
            ssl: false,
            starttls: false,
            hello_name: None,
            debug: false,
        }
    }
}

mod defaults {
    pub fn host() -> String {
        String::from("localhost")
    }

    pub const fn port() -> u16 {
        25
    }

    pub const fn timeout_ms() -> u64 {
        10_000
    }
}

/// [`MailTransport`] relaying through a single SMTP server
pub struct SmtpMailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    server: String,
    debug: bool,
}

impl std::fmt::Debug for SmtpMailTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailTransport")
            .field("server", &self.server)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl SmtpMailTransport {
    /// # Errors
    /// If TLS is requested but its parameters cannot be built
    pub fn new(config: &SmtpConfig) -> Result<Self, DeliveryError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .timeout(Some(Duration::from_millis(config.timeout_ms)));

        if config.ssl || config.starttls {
            let parameters = TlsParameters::new(config.host.clone()).map_err(|err| {
                SystemError::Configuration(format!("TLS parameters for {}: {err}", config.host))
            })?;

            builder = builder.tls(if config.ssl {
                Tls::Wrapper(parameters)
            } else {
                Tls::Required(parameters)
            });
        }

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        if let Some(hello_name) = &config.hello_name {
            builder = builder.hello_name(ClientId::Domain(hello_name.clone()));
        }

        internal!(
            level = DEBUG,
            "SMTP transport configured for {}:{} (ssl={}, starttls={})",
            config.host,
            config.port,
            config.ssl,
            config.starttls
        );

        Ok(Self {
            transport: builder.build(),
            server: format!("{}:{}", config.host, config.port),
            debug: config.debug,
        })
    }
}

fn envelope(message: &OutboundMessage) -> Result<Envelope, TemporaryError> {
    let parse = |addr: &str| {
        addr.parse::<Address>()
            .map_err(|err| TemporaryError::Envelope(format!("{addr}: {err}")))
    };

    let sender = message.sender.as_deref().map(parse).transpose()?;
    let recipients = message
        .recipients
        .iter()
        .map(|addr| parse(addr))
        .collect::<Result<Vec<_>, _>>()?;

    Envelope::new(sender, recipients).map_err(|err| TemporaryError::Envelope(err.to_string()))
}

fn classify(err: &lettre::transport::smtp::Error) -> DeliveryError {
    let reason = err.to_string();

    if err.is_permanent() {
        PermanentError::Rejected(reason).into()
    } else if err.is_timeout() {
        TemporaryError::Timeout(reason).into()
    } else if err.is_transient() {
        TemporaryError::SmtpTemporary(reason).into()
    } else {
        TemporaryError::ConnectionFailed(reason).into()
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(server = %self.server)), timing(precision = "ms"))]
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let envelope = envelope(message)?;

        if self.debug {
            outgoing!(
                level = DEBUG,
                "MAIL FROM:<{}> RCPT TO:{:?} ({} bytes) via {}",
                message.sender.as_deref().unwrap_or_default(),
                message.recipients,
                message.raw.len(),
                self.server
            );
        }

        match self.transport.send_raw(&envelope, &message.raw).await {
            Ok(response) => {
                if self.debug {
                    outgoing!(
                        level = DEBUG,
                        "{} {}",
                        response.code(),
                        response.first_line().unwrap_or_default()
                    );
                }
                Ok(())
            }
            Err(err) => {
                if self.debug {
                    outgoing!(level = DEBUG, "Relay {} refused: {err}", self.server);
                }
                Err(classify(&err))
            }
        }
    }
}
