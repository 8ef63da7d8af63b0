use crate::model::MailTransport;
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const BASE64_LINE: usize = 76;
/// Raw bytes per RFC 2047 encoded word, keeping each word under 75 chars
const ENCODED_WORD_BYTES: usize = 45;

#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    /// JPEG to attach as `snapshot.jpg`
    pub attachment: Option<PathBuf>,
}

/// Mail collaborator: deliver one message or report why not.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, transport: &MailTransport, message: &MailMessage) -> anyhow::Result<()>;
}

/// Pipes a rendered MIME message into a sendmail-compatible command.
pub struct SendmailMailer {
    command: Vec<String>,
    timeout: Duration,
}

impl SendmailMailer {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    fn args(&self, transport: &MailTransport, from: &str) -> anyhow::Result<(String, Vec<String>)> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("mail command is empty"))?;
        let args = args
            .iter()
            .map(|arg| {
                arg.replace("{smtp_host}", &transport.host)
                    .replace("{smtp_port}", &transport.port.to_string())
                    .replace("{smtp_user}", transport.user.as_deref().unwrap_or(""))
                    .replace("{from}", bare_address(from))
            })
            .collect();
        Ok((program.clone(), args))
    }
}

#[async_trait]
impl Mailer for SendmailMailer {
    async fn send(&self, transport: &MailTransport, message: &MailMessage) -> anyhow::Result<()> {
        let (program, args) = self.args(transport, &message.from)?;

        let attachment = match &message.attachment {
            Some(path) => Some(
                fs::read(path)
                    .await
                    .with_context(|| format!("failed to read attachment {:?}", path))?,
            ),
            None => None,
        };
        let rendered = render_message(message, attachment.as_deref(), Utc::now());

        let mut child = Command::new(&program)
            .args(&args)
            .env("NVR_SMTP_PASS", transport.pass.as_deref().unwrap_or(""))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn mail command {}", program))?;

        let mut stdin = child.stdin.take();
        let delivery = async move {
            if let Some(stdin) = stdin.as_mut() {
                stdin.write_all(rendered.as_bytes()).await?;
            }
            // EOF for the command
            drop(stdin);
            child.wait_with_output().await
        };
        // Dropping the future kills the child.
        let output = tokio::time::timeout(self.timeout, delivery)
            .await
            .map_err(|_| anyhow!("mail command timed out after {:?}", self.timeout))?
            .context("mail command failed")?;
        if !output.status.success() {
            bail!(
                "mail command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!("Mail to {} handed to {}", message.to, program);
        Ok(())
    }
}

/// `Name <addr>` -> `addr`
fn bare_address(mailbox: &str) -> &str {
    match (mailbox.find('<'), mailbox.rfind('>')) {
        (Some(start), Some(end)) if start < end => &mailbox[start + 1..end],
        _ => mailbox.trim(),
    }
}

/// Single-line header value. Line breaks are dropped, and non-ASCII text
/// becomes folded RFC 2047 `B` encoded words.
fn header_value(value: &str) -> String {
    let line: String = value.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    if line.is_ascii() {
        return line;
    }

    let mut words = Vec::new();
    let mut start = 0;
    while start < line.len() {
        let mut end = (start + ENCODED_WORD_BYTES).min(line.len());
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(&line.as_bytes()[start..end]);
        words.push(format!("=?UTF-8?B?{}?=", encoded));
        start = end;
    }
    words.join("\r\n ")
}

/// Renders an RFC 5322 message, multipart when an attachment is present.
pub fn render_message(message: &MailMessage, attachment: Option<&[u8]>, now: DateTime<Utc>) -> String {
    let mut out = format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\n",
        header_value(&message.from),
        header_value(&message.to),
        header_value(&message.subject),
        now.to_rfc2822()
    );

    let Some(bytes) = attachment else {
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        out.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
        out.push_str(&message.body);
        out.push_str("\r\n");
        return out;
    };

    let boundary = format!("nvr-{}", now.timestamp_millis());
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);

    out.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
        boundary
    ));
    out.push_str(&format!("--{}\r\n", boundary));
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
    out.push_str(&message.body);
    out.push_str("\r\n");
    out.push_str(&format!("--{}\r\n", boundary));
    out.push_str("Content-Type: image/jpeg; name=\"snapshot.jpg\"\r\n");
    out.push_str("Content-Transfer-Encoding: base64\r\n");
    out.push_str("Content-Disposition: attachment; filename=\"snapshot.jpg\"\r\n\r\n");
    for line in encoded.as_bytes().chunks(BASE64_LINE) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push_str("\r\n");
    }
    out.push_str(&format!("--{}--\r\n", boundary));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(attachment: Option<PathBuf>) -> MailMessage {
        MailMessage {
            from: "NVR System <no-reply@nvr.local>".into(),
            to: "me@example.com".into(),
            subject: "Motion Detected: Front".into(),
            body: "Motion was detected on camera Front.".into(),
            attachment,
        }
    }

    fn transport() -> MailTransport {
        MailTransport {
            host: "smtp.example.com".into(),
            port: 587,
            user: Some("nvr".into()),
            pass: Some("secret".into()),
            recipient: "me@example.com".into(),
        }
    }

    #[test]
    fn plain_message_has_headers_and_body() {
        let now = Utc.with_ymd_and_hms(2025, 12, 3, 7, 49, 51).unwrap();
        let text = render_message(&message(None), None, now);

        assert!(text.starts_with("From: NVR System <no-reply@nvr.local>\r\n"));
        assert!(text.contains("Subject: Motion Detected: Front\r\n"));
        assert!(text.contains("Content-Type: text/plain"));
        assert!(text.ends_with("Motion was detected on camera Front.\r\n"));
    }

    #[test]
    fn attachment_is_base64_in_a_multipart_body() {
        let now = Utc.with_ymd_and_hms(2025, 12, 3, 7, 49, 51).unwrap();
        let jpeg = vec![0xffu8; 200];
        let text = render_message(&message(Some("x.jpg".into())), Some(&jpeg), now);

        let boundary = format!("nvr-{}", now.timestamp_millis());
        assert!(text.contains(&format!("boundary=\"{}\"", boundary)));
        assert!(text.contains("filename=\"snapshot.jpg\""));
        assert!(text.ends_with(&format!("--{}--\r\n", boundary)));

        let encoded = base64::engine::general_purpose::STANDARD.encode(&jpeg);
        assert!(text.contains(&encoded[..BASE64_LINE]));
        assert!(text.lines().all(|line| line.len() <= 998));
    }

    #[test]
    fn command_placeholders_are_substituted_without_password() {
        let mailer = SendmailMailer::new(
            vec![
                "msmtp".into(),
                "--host={smtp_host}".into(),
                "--port={smtp_port}".into(),
                "--user={smtp_user}".into(),
                "--from={from}".into(),
                "-t".into(),
            ],
            Duration::from_secs(30),
        );
        let (program, args) = mailer
            .args(&transport(), "NVR System <no-reply@nvr.local>")
            .unwrap();

        assert_eq!(program, "msmtp");
        assert_eq!(
            args,
            vec![
                "--host=smtp.example.com",
                "--port=587",
                "--user=nvr",
                "--from=no-reply@nvr.local",
                "-t"
            ]
        );
        assert!(args.iter().all(|a| !a.contains("secret")));
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let mailer = SendmailMailer::new(vec!["false".into()], Duration::from_secs(30));
        assert!(mailer.send(&transport(), &message(None)).await.is_err());
    }

    #[tokio::test]
    async fn command_that_never_reads_its_input_times_out() {
        let temp = tempfile::tempdir().unwrap();
        let snapshot = temp.path().join("snapshot.jpg");
        std::fs::write(&snapshot, vec![0xd8u8; 1024 * 1024]).unwrap();

        let mailer = SendmailMailer::new(
            vec!["sleep".into(), "5".into()],
            Duration::from_millis(200),
        );
        let started = std::time::Instant::now();
        let err = mailer
            .send(&transport(), &message(Some(snapshot)))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn line_breaks_cannot_add_headers() {
        let now = Utc.with_ymd_and_hms(2025, 12, 3, 7, 49, 51).unwrap();
        let mut crafted = message(None);
        crafted.subject = "Motion Detected: Front\r\nBcc: victim@example.com".into();
        crafted.to = "me@example.com\nCc: other@example.com".into();
        let text = render_message(&crafted, None, now);

        assert!(text.contains("Subject: Motion Detected: FrontBcc: victim@example.com\r\n"));
        assert!(!text.lines().any(|line| line.starts_with("Bcc:") || line.starts_with("Cc:")));
    }

    #[test]
    fn non_ascii_subject_is_encoded_and_folded() {
        let now = Utc.with_ymd_and_hms(2025, 12, 3, 7, 49, 51).unwrap();
        let mut named = message(None);
        named.subject = "Motion Detected: Einfahrt Nord – Garagentor über dem Hof 北門".into();
        let text = render_message(&named, None, now);

        let header = &text[text.find("Subject: ").unwrap() + 9..text.find("\r\nDate:").unwrap()];
        assert!(header.is_ascii());
        let mut decoded = Vec::new();
        for word in header.split("\r\n ") {
            assert!(word.len() <= 75);
            let payload = word
                .strip_prefix("=?UTF-8?B?")
                .and_then(|w| w.strip_suffix("?="))
                .unwrap();
            decoded.extend(base64::engine::general_purpose::STANDARD.decode(payload).unwrap());
        }
        assert!(header.contains("\r\n "));
        assert_eq!(String::from_utf8(decoded).unwrap(), named.subject);
    }

    #[test]
    fn empty_command_is_rejected() {
        let mailer = SendmailMailer::new(Vec::new(), Duration::from_secs(30));
        assert!(mailer.args(&transport(), "a@b.c").is_err());
    }
}
