mod file;
mod smtp;

pub use file::FileTransport;
pub use smtp::{SmtpSettings, SmtpTransport};
