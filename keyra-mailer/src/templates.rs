//! The sign-in email carrying a magic link.

use askama::Template;

use crate::{Email, MailerConfig, MailerError};

#[derive(Template)]
#[template(
    source = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Sign in to {{ app_name }}</title>
</head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
    <h2>Sign in to {{ app_name }}</h2>
    <p>Click the link below to sign in. It can be used once and expires in {{ expires_in_minutes }} minutes.</p>
    <p><a href="{{ magic_link }}">Sign in</a></p>
    <p style="word-break: break-all; font-family: monospace;">{{ magic_link }}</p>
    <p>If you didn't request this email, you can safely ignore it.</p>
</body>
</html>"#,
    ext = "html"
)]
struct MagicLinkHtml<'a> {
    app_name: &'a str,
    magic_link: &'a str,
    expires_in_minutes: i64,
}

#[derive(Template)]
#[template(
    source = r#"Sign in to {{ app_name }}

Open this link to sign in. It can be used once and expires in {{ expires_in_minutes }} minutes.

{{ magic_link }}

If you didn't request this email, you can safely ignore it."#,
    ext = "txt"
)]
struct MagicLinkText<'a> {
    app_name: &'a str,
    magic_link: &'a str,
    expires_in_minutes: i64,
}

/// The sign-in message for a magic link.
pub struct MagicLinkEmail;

impl MagicLinkEmail {
    pub fn build(
        config: &MailerConfig,
        to: &str,
        magic_link: &str,
        expires_in_minutes: i64,
    ) -> Result<Email, MailerError> {
        let app_name = config.app_name.as_str();

        let email = Email {
            to: to.to_string(),
            from: config.sender(),
            subject: format!("Sign in to {app_name}"),
            text_body: MagicLinkText {
                app_name,
                magic_link,
                expires_in_minutes,
            }
            .render()?,
            html_body: MagicLinkHtml {
                app_name,
                magic_link,
                expires_in_minutes,
            }
            .render()?,
        };

        email.validate()?;
        Ok(email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_link_email_contains_link() {
        let config = MailerConfig::default();
        let link = "https://app.example.com/auth/verify?token=abc123";

        let email = MagicLinkEmail::build(&config, "a@x.com", link, 15).unwrap();

        assert_eq!(email.to, "a@x.com");
        assert_eq!(email.subject, "Sign in to Keyra");
        assert!(email.text_body.contains(link));
        assert!(email.text_body.contains("15 minutes"));
        // html rendering escapes the query separator
        assert!(email.html_body.contains("abc123"));
    }
}
