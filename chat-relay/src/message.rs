use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub name: String,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A single chat message as it travels through the relay.
///
/// The hub never mutates a message. `recipient` is carried along for clients
/// to display but does not restrict who receives it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub sender: User,
    pub recipient: User,
    pub body: String,
}

impl Message {
    /// Builds a message with a freshly generated id.
    pub fn new(sender: User, recipient: User, body: impl Into<String>) -> Self {
        Self {
            id: nanoid::nanoid!(),
            sender,
            recipient,
            body: body.into(),
        }
    }
}

/// Reads one newline-delimited JSON value, returning `Ok(None)` at end of input.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Line-framed JSON reader usable as a hub message source.
pub struct JsonLines<R> {
    reader: R,
}

impl<R> JsonLines<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub async fn next_message(&mut self) -> io::Result<Option<Message>> {
        read_message(&mut self.reader).await
    }
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_lines_skips_blank_lines_and_reports_end_of_input() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut lines = JsonLines::new(tokio::io::BufReader::new(reader));
        let message = Message::new(User::new("alice"), User::new("bob"), "hi");

        writer.write_all(b"\r\n\n").await.expect("write blanks");
        write_message(&mut writer, &message)
            .await
            .expect("write message");
        drop(writer);

        let parsed = lines
            .next_message()
            .await
            .expect("read message")
            .expect("expected message");
        assert_eq!(parsed, message);
        assert!(lines.next_message().await.expect("read eof").is_none());
    }

    #[tokio::test]
    async fn malformed_line_is_invalid_data() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut lines = JsonLines::new(tokio::io::BufReader::new(reader));

        writer.write_all(b"{not json}\n").await.expect("write garbage");

        let err = lines.next_message().await.expect_err("garbage must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = Message::new(User::new("alice"), User::new("bob"), "one");
        let b = Message::new(User::new("alice"), User::new("bob"), "one");
        assert_ne!(a.id, b.id);
        assert!(!a.id.is_empty());
    }
}
