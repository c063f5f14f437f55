//! Turning a spooled payload into something a transport can send.

use mailparse::{MailAddr, MailHeader, MailHeaderMap};

use crate::error::{DeliveryError, PermanentError, TemporaryError};

/// A parsed message ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Envelope sender, from `Sender` or else `From`
    pub sender: Option<String>,
    /// Envelope recipients, from `To`, `Cc` and `Bcc`
    pub recipients: Vec<String>,
    /// Bytes to transmit, with `Bcc` headers removed
    pub raw: Vec<u8>,
}

/// Parse `raw` and resolve its envelope
///
/// When `test_recipient` is set it replaces every resolved recipient, and the
/// message is considered addressed even if its headers name nobody.
///
/// # Errors
/// [`PermanentError::Unparseable`] if the header block is malformed or empty,
/// [`PermanentError::NoRecipients`] if nobody would receive the message and
/// [`TemporaryError::Envelope`] if an address header cannot be parsed
pub fn prepare(raw: &[u8], test_recipient: Option<&str>) -> Result<OutboundMessage, DeliveryError> {
    let (headers, body_offset) =
        mailparse::parse_headers(raw).map_err(|err| PermanentError::Unparseable(err.to_string()))?;

    if headers.is_empty() {
        return Err(PermanentError::Unparseable(String::from("message has no headers")).into());
    }

    let sender = match headers.get_first_header("Sender") {
        Some(header) => first_address(header)?,
        None => headers
            .get_first_header("From")
            .map(first_address)
            .transpose()?
            .flatten(),
    };

    let recipients = match test_recipient {
        Some(recipient) => vec![recipient.to_string()],
        None => {
            let mut recipients = Vec::new();
            for header in &headers {
                let key = header.get_key_ref();
                if ["To", "Cc", "Bcc"]
                    .iter()
                    .any(|name| key.eq_ignore_ascii_case(name))
                {
                    recipients.extend(addresses(header)?);
                }
            }
            recipients
        }
    };

    if recipients.is_empty() {
        return Err(PermanentError::NoRecipients.into());
    }

    Ok(OutboundMessage {
        sender,
        recipients,
        raw: strip_bcc(raw, body_offset),
    })
}

fn addresses(header: &MailHeader<'_>) -> Result<Vec<String>, TemporaryError> {
    let list = mailparse::addrparse_header(header).map_err(|err| {
        TemporaryError::Envelope(format!("invalid {} header: {err}", header.get_key_ref()))
    })?;

    Ok(list
        .iter()
        .flat_map(|addr| match addr {
            MailAddr::Single(single) => vec![single.addr.clone()],
            MailAddr::Group(group) => group.addrs.iter().map(|single| single.addr.clone()).collect(),
        })
        .collect())
}

fn first_address(header: &MailHeader<'_>) -> Result<Option<String>, TemporaryError> {
    Ok(addresses(header)?.into_iter().next())
}

/// Copy of `raw` without any `Bcc` header, continuation lines included
fn strip_bcc(raw: &[u8], body_offset: usize) -> Vec<u8> {
    let (head, body) = raw.split_at(body_offset.min(raw.len()));
    let mut out = Vec::with_capacity(raw.len());
    let mut skipping = false;

    for line in head.split_inclusive(|&b| b == b'\n') {
        let continuation = line.first().is_some_and(|&b| b == b' ' || b == b'\t');
        if !continuation {
            skipping = line.len() >= 4 && line[..4].eq_ignore_ascii_case(b"bcc:");
        }

        if !skipping {
            out.extend_from_slice(line);
        }
    }

    out.extend_from_slice(body);
    out
}
