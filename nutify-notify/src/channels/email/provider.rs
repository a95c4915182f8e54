//! Known SMTP provider presets.
//!
//! A mail config may carry a provider tag; presets fill in transport
//! defaults and mark providers that refuse to infer a sender address.

/// Transport defaults for one provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderPreset {
    pub key: &'static str,
    pub display_name: &'static str,
    pub smtp_server: &'static str,
    pub smtp_port: u16,
    pub tls: bool,
    pub tls_starttls: bool,
    /// SES-class providers authenticate with an access key and require an
    /// explicit verified sender address.
    pub requires_sender_email: bool,
}

pub static PROVIDERS: &[ProviderPreset] = &[
    ProviderPreset {
        key: "gmail",
        display_name: "Gmail",
        smtp_server: "smtp.gmail.com",
        smtp_port: 587,
        tls: true,
        tls_starttls: true,
        requires_sender_email: false,
    },
    ProviderPreset {
        key: "outlook",
        display_name: "Outlook (Microsoft)",
        smtp_server: "smtp.office365.com",
        smtp_port: 587,
        tls: true,
        tls_starttls: true,
        requires_sender_email: false,
    },
    ProviderPreset {
        key: "icloud",
        display_name: "Apple iCloud Mail",
        smtp_server: "smtp.mail.me.com",
        smtp_port: 587,
        tls: true,
        tls_starttls: true,
        requires_sender_email: false,
    },
    ProviderPreset {
        key: "yahoo",
        display_name: "Yahoo Mail",
        smtp_server: "smtp.mail.yahoo.com",
        smtp_port: 587,
        tls: true,
        tls_starttls: true,
        requires_sender_email: false,
    },
    ProviderPreset {
        key: "aol",
        display_name: "AOL Mail",
        smtp_server: "smtp.aol.com",
        smtp_port: 587,
        tls: true,
        tls_starttls: true,
        requires_sender_email: false,
    },
    ProviderPreset {
        key: "gmx",
        display_name: "GMX Mail",
        smtp_server: "mail.gmx.com",
        smtp_port: 587,
        tls: true,
        tls_starttls: true,
        requires_sender_email: false,
    },
    ProviderPreset {
        key: "protonmail",
        display_name: "ProtonMail",
        smtp_server: "smtp.protonmail.ch",
        smtp_port: 587,
        tls: true,
        tls_starttls: true,
        requires_sender_email: false,
    },
    ProviderPreset {
        key: "amazon",
        display_name: "Amazon SES",
        smtp_server: "email-smtp.us-east-1.amazonaws.com",
        smtp_port: 587,
        tls: true,
        tls_starttls: true,
        requires_sender_email: true,
    },
    ProviderPreset {
        key: "sendgrid",
        display_name: "SendGrid",
        smtp_server: "smtp.sendgrid.net",
        smtp_port: 587,
        tls: true,
        tls_starttls: true,
        requires_sender_email: false,
    },
    ProviderPreset {
        key: "mailgun",
        display_name: "Mailgun",
        smtp_server: "smtp.mailgun.org",
        smtp_port: 587,
        tls: true,
        tls_starttls: true,
        requires_sender_email: false,
    },
    ProviderPreset {
        key: "postmark",
        display_name: "Postmark",
        smtp_server: "smtp.postmarkapp.com",
        smtp_port: 587,
        tls: true,
        tls_starttls: true,
        requires_sender_email: false,
    },
];

pub fn preset(key: &str) -> Option<&'static ProviderPreset> {
    PROVIDERS.iter().find(|p| p.key == key)
}

/// Whether the tagged provider refuses delivery without an explicit sender.
pub fn requires_sender_email(provider: Option<&str>) -> bool {
    provider
        .and_then(preset)
        .map(|p| p.requires_sender_email)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_lookup() {
        let gmail = preset("gmail").unwrap();
        assert_eq!(gmail.smtp_server, "smtp.gmail.com");
        assert_eq!(gmail.smtp_port, 587);
        assert!(preset("fax-machine").is_none());
    }

    #[test]
    fn test_ses_requires_sender() {
        assert!(requires_sender_email(Some("amazon")));
        assert!(!requires_sender_email(Some("gmail")));
        assert!(!requires_sender_email(None));
    }
}
