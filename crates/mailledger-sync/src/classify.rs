//! Classification of worker error codes.
//!
//! The worker reports failures as short codes such as `ErrorAuthentication`
//! in the `error` field of its final status line. This module maps them to
//! user-facing messages. Codes that are not in the table pass through as-is.

/// Broad family an error code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Could not reach the server.
    Connection,
    /// TLS or certificate trouble.
    Tls,
    /// Credentials rejected or required.
    Authentication,
    /// Server response could not be parsed.
    Parse,
    /// Folder does not exist.
    Folder,
    /// Provider specific condition (Gmail, Yahoo, Outlook, `MobileMe`).
    Provider,
    /// Failure while sending a message.
    Sending,
    /// Identity or account configuration is incomplete.
    Identity,
}

/// Known worker error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorCode {
    Connection,
    InvalidAccount,
    TlsNotAvailable,
    Parse,
    Certificate,
    Authentication,
    GmailImapNotEnabled,
    GmailExceededBandwidthLimit,
    GmailTooManySimultaneousConnections,
    MobileMeMoved,
    YahooUnavailable,
    NonExistantFolder,
    StartTlsNotAvailable,
    GmailApplicationSpecificPasswordRequired,
    OutlookLoginViaWebBrowser,
    NeedsConnectToWebmail,
    NoValidServerFound,
    AuthenticationRequired,
    SendMessageNotAllowed,
    SendMessageIllegalAttachment,
    YahooSendMessageSpamSuspected,
    YahooSendMessageDailyLimitExceeded,
    NoSender,
    InvalidRelaySmtp,
    NoImplementedAuthMethods,
    IdentityMissingFields,
}

impl ErrorCode {
    /// Every known code, in table order.
    pub const ALL: [Self; 26] = [
        Self::Connection,
        Self::InvalidAccount,
        Self::TlsNotAvailable,
        Self::Parse,
        Self::Certificate,
        Self::Authentication,
        Self::GmailImapNotEnabled,
        Self::GmailExceededBandwidthLimit,
        Self::GmailTooManySimultaneousConnections,
        Self::MobileMeMoved,
        Self::YahooUnavailable,
        Self::NonExistantFolder,
        Self::StartTlsNotAvailable,
        Self::GmailApplicationSpecificPasswordRequired,
        Self::OutlookLoginViaWebBrowser,
        Self::NeedsConnectToWebmail,
        Self::NoValidServerFound,
        Self::AuthenticationRequired,
        Self::SendMessageNotAllowed,
        Self::SendMessageIllegalAttachment,
        Self::YahooSendMessageSpamSuspected,
        Self::YahooSendMessageDailyLimitExceeded,
        Self::NoSender,
        Self::InvalidRelaySmtp,
        Self::NoImplementedAuthMethods,
        Self::IdentityMissingFields,
    ];

    /// The wire code as emitted by the worker.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "ErrorConnection",
            Self::InvalidAccount => "ErrorInvalidAccount",
            Self::TlsNotAvailable => "ErrorTLSNotAvailable",
            Self::Parse => "ErrorParse",
            Self::Certificate => "ErrorCertificate",
            Self::Authentication => "ErrorAuthentication",
            Self::GmailImapNotEnabled => "ErrorGmailIMAPNotEnabled",
            Self::GmailExceededBandwidthLimit => "ErrorGmailExceededBandwidthLimit",
            Self::GmailTooManySimultaneousConnections => {
                "ErrorGmailTooManySimultaneousConnections"
            }
            Self::MobileMeMoved => "ErrorMobileMeMoved",
            Self::YahooUnavailable => "ErrorYahooUnavailable",
            Self::NonExistantFolder => "ErrorNonExistantFolder",
            Self::StartTlsNotAvailable => "ErrorStartTLSNotAvailable",
            Self::GmailApplicationSpecificPasswordRequired => {
                "ErrorGmailApplicationSpecificPasswordRequired"
            }
            Self::OutlookLoginViaWebBrowser => "ErrorOutlookLoginViaWebBrowser",
            Self::NeedsConnectToWebmail => "ErrorNeedsConnectToWebmail",
            Self::NoValidServerFound => "ErrorNoValidServerFound",
            Self::AuthenticationRequired => "ErrorAuthenticationRequired",
            Self::SendMessageNotAllowed => "ErrorSendMessageNotAllowed",
            Self::SendMessageIllegalAttachment => "ErrorSendMessageIllegalAttachment",
            Self::YahooSendMessageSpamSuspected => "ErrorYahooSendMessageSpamSuspected",
            Self::YahooSendMessageDailyLimitExceeded => "ErrorYahooSendMessageDailyLimitExceeded",
            Self::NoSender => "ErrorNoSender",
            Self::InvalidRelaySmtp => "ErrorInvalidRelaySMTP",
            Self::NoImplementedAuthMethods => "ErrorNoImplementedAuthMethods",
            Self::IdentityMissingFields => "ErrorIdentityMissingFields",
        }
    }

    /// Looks up a wire code. Matching is exact.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }

    /// Category of this code.
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::Connection | Self::NoValidServerFound => ErrorCategory::Connection,
            Self::TlsNotAvailable | Self::Certificate | Self::StartTlsNotAvailable => {
                ErrorCategory::Tls
            }
            Self::Authentication | Self::AuthenticationRequired => ErrorCategory::Authentication,
            Self::Parse => ErrorCategory::Parse,
            Self::NonExistantFolder => ErrorCategory::Folder,
            Self::GmailImapNotEnabled
            | Self::GmailExceededBandwidthLimit
            | Self::GmailTooManySimultaneousConnections
            | Self::GmailApplicationSpecificPasswordRequired
            | Self::MobileMeMoved
            | Self::YahooUnavailable
            | Self::OutlookLoginViaWebBrowser
            | Self::NeedsConnectToWebmail => ErrorCategory::Provider,
            Self::SendMessageNotAllowed
            | Self::SendMessageIllegalAttachment
            | Self::YahooSendMessageSpamSuspected
            | Self::YahooSendMessageDailyLimitExceeded
            | Self::NoSender
            | Self::InvalidRelaySmtp
            | Self::NoImplementedAuthMethods => ErrorCategory::Sending,
            Self::InvalidAccount | Self::IdentityMissingFields => ErrorCategory::Identity,
        }
    }

    /// English message for this code, before localization.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Connection => {
                "Connection Error - Unable to connect to the server / port you provided."
            }
            Self::InvalidAccount => {
                "This account is invalid or MailLedger could not find the Inbox or All Mail folder."
            }
            Self::TlsNotAvailable => "TLS Not Available",
            Self::Parse => "Parsing Error",
            Self::Certificate => "Certificate Error",
            Self::Authentication => "Authentication Error - Check your username and password.",
            Self::GmailImapNotEnabled => {
                "Gmail IMAP is not enabled. Visit Gmail settings to turn it on."
            }
            Self::GmailExceededBandwidthLimit => "Gmail bandwidth exceeded. Please try again later.",
            Self::GmailTooManySimultaneousConnections => {
                "There are too many active connections to your Gmail account. Please try again later."
            }
            Self::MobileMeMoved => "MobileMe has moved.",
            Self::YahooUnavailable => "Yahoo is unavailable.",
            Self::NonExistantFolder => "Sorry, this folder does not exist.",
            Self::StartTlsNotAvailable => "StartTLS is not available.",
            Self::GmailApplicationSpecificPasswordRequired => {
                "A Gmail application-specific password is required."
            }
            Self::OutlookLoginViaWebBrowser => {
                "The Outlook server said you must sign in via a web browser."
            }
            Self::NeedsConnectToWebmail => "The server said you must sign in via your webmail.",
            Self::NoValidServerFound => "No valid server found.",
            Self::AuthenticationRequired => "Authentication required.",
            Self::SendMessageNotAllowed => "Sending is not enabled for this account.",
            Self::SendMessageIllegalAttachment => {
                "The message contains an illegal attachment that is not allowed by the server."
            }
            Self::YahooSendMessageSpamSuspected => {
                "The message has been blocked by Yahoo's outbound spam filter."
            }
            Self::YahooSendMessageDailyLimitExceeded => {
                "The message has been blocked by Yahoo - you have exceeded your daily sending limit."
            }
            Self::NoSender => "The message has been blocked because no sender is configured.",
            Self::InvalidRelaySmtp => {
                "The SMTP server would not relay a message. You may need to authenticate."
            }
            Self::NoImplementedAuthMethods => {
                "Sorry, your SMTP server does not support basic username / password authentication."
            }
            Self::IdentityMissingFields => {
                "Your MailLedger ID is missing required fields - you may need to reset MailLedger."
            }
        }
    }
}

/// Source of translated strings.
///
/// The string table itself lives outside this crate; implementors receive the
/// English text and return the translation.
pub trait Localizer: Send + Sync {
    /// Translates `text`.
    fn localize(&self, text: &str) -> String;
}

/// Returns English text unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocalization;

impl Localizer for NoLocalization {
    fn localize(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Classifies a raw code using English messages.
#[must_use]
pub fn classify(raw_code: &str, service: Option<&str>) -> String {
    classify_with(&NoLocalization, raw_code, service)
}

/// Classifies a raw code and appends the uppercased service, if any.
#[must_use]
pub fn classify_with(localizer: &dyn Localizer, raw_code: &str, service: Option<&str>) -> String {
    let message = ErrorCode::from_code(raw_code).map_or_else(
        || raw_code.to_string(),
        |code| localizer.localize(code.message()),
    );

    match service {
        Some(service) if !service.is_empty() => {
            format!("{message} ({})", service.to_uppercase())
        }
        _ => message,
    }
}

/// Message for a failure that could not be classified.
#[must_use]
pub fn unknown_error(localizer: &dyn Localizer, exit_code: Option<i32>) -> String {
    let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    format!(
        "{} (mailsync: {code})",
        localizer.localize("An unknown error has occurred")
    )
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    struct Shouting;

    impl Localizer for Shouting {
        fn localize(&self, text: &str) -> String {
            text.to_uppercase()
        }
    }

    #[test]
    fn test_known_code() {
        assert_eq!(
            classify("ErrorAuthentication", None),
            "Authentication Error - Check your username and password."
        );
    }

    #[test]
    fn test_unknown_code_passes_through() {
        assert_eq!(classify("ErrorSomethingNew", None), "ErrorSomethingNew");
        assert_eq!(classify("", None), "");
    }

    #[test]
    fn test_service_suffix_uppercased() {
        assert_eq!(
            classify("ErrorConnection", Some("smtp")),
            "Connection Error - Unable to connect to the server / port you provided. (SMTP)"
        );
        assert_eq!(classify("x", Some("imap")), "x (IMAP)");
        assert_eq!(classify("x", Some("")), "x");
    }

    #[test]
    fn test_localizer_is_applied() {
        assert_eq!(
            classify_with(&Shouting, "ErrorParse", Some("imap")),
            "PARSING ERROR (IMAP)"
        );
        // Unknown codes are not run through the string table.
        assert_eq!(classify_with(&Shouting, "weird", None), "weird");
    }

    #[test]
    fn test_round_trip_table() {
        for code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_code(code.as_str()), Some(code));
            assert!(!code.message().is_empty());
        }
    }

    #[test]
    fn test_categories() {
        assert_eq!(ErrorCode::Certificate.category(), ErrorCategory::Tls);
        assert_eq!(
            ErrorCode::GmailTooManySimultaneousConnections.category(),
            ErrorCategory::Provider
        );
        assert_eq!(ErrorCode::InvalidRelaySmtp.category(), ErrorCategory::Sending);
        assert_eq!(
            ErrorCode::IdentityMissingFields.category(),
            ErrorCategory::Identity
        );
    }

    #[test]
    fn test_unknown_error_includes_exit_code() {
        assert_eq!(
            unknown_error(&NoLocalization, Some(3)),
            "An unknown error has occurred (mailsync: 3)"
        );
        assert!(unknown_error(&NoLocalization, None).ends_with("(mailsync: signal)"));
    }
}
