use std::fmt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::TryStreamExt;
use sha2::{Digest, Sha256, Sha512};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::{Error, Result};

/// Digest algorithms an artifact checksum may use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl Algorithm {
    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Sha256 => f.write_str("sha256"),
            Algorithm::Sha512 => f.write_str("sha512"),
        }
    }
}

/// An expected digest together with the algorithm that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checksum {
    algorithm: Algorithm,
    digest: String,
}

impl Checksum {
    /// Parses a hex digest for `algorithm`.
    pub fn new(algorithm: Algorithm, digest: &str) -> Result<Self> {
        let digest = digest.trim().to_ascii_lowercase();
        if digest.len() != algorithm.hex_len() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Configuration(format!(
                "{:?} is not a valid {} digest",
                digest, algorithm
            )));
        }
        Ok(Checksum { algorithm, digest })
    }

    /// Parses a `sha256sum` style line: the digest followed by an optional file name.
    pub fn from_sidecar(algorithm: Algorithm, contents: &str) -> Result<Self> {
        let digest = contents.split_whitespace().next().unwrap_or_default();
        Checksum::new(algorithm, digest)
    }

    /// The SHA-256 checksum of `bytes`.
    pub fn sha256_of(bytes: &[u8]) -> Self {
        Checksum {
            algorithm: Algorithm::Sha256,
            digest: format!("{:x}", Sha256::digest(bytes)),
        }
    }

    /// The algorithm this checksum was computed with.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Lowercase hex digest.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn hex(&self) -> String {
        match self {
            Hasher::Sha256(h) => format!("{:x}", h.clone().finalize()),
            Hasher::Sha512(h) => format!("{:x}", h.clone().finalize()),
        }
    }
}

/// A readable artifact with a known expected checksum.
///
/// Every byte read through the source is hashed, so once the installer has
/// consumed it [`Source::verify_checksum`] reports whether what was written
/// matches what was expected. Dropping the source closes the underlying
/// file or connection.
pub struct Source {
    name: String,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    expected: Checksum,
    hasher: Hasher,
}

impl Source {
    /// Wraps any reader.
    pub fn new<R>(name: impl Into<String>, reader: R, expected: Checksum) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Source {
            name: name.into(),
            reader: Box::new(reader),
            hasher: Hasher::new(expected.algorithm),
            expected,
        }
    }

    /// A source for bytes compiled into the binary.
    pub fn embedded(name: impl Into<String>, bytes: &'static [u8]) -> Self {
        Source::new(name, io::Cursor::new(bytes), Checksum::sha256_of(bytes))
    }

    /// A source for bytes already in memory.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>, expected: Checksum) -> Self {
        Source::new(name, io::Cursor::new(bytes), expected)
    }

    /// Opens a file on the local filesystem.
    pub async fn open<P: AsRef<Path>>(path: P, expected: Checksum) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::io("opening artifact", path, e))?;
        Ok(Source::new(path.display().to_string(), file, expected))
    }

    /// Opens a local file whose expected SHA-256 digest sits next to it in `<path>.sha256`.
    pub async fn open_with_sidecar<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(".sha256");
        let contents = tokio::fs::read_to_string(&sidecar)
            .await
            .map_err(|e| Error::io("reading artifact checksum", &sidecar, e))?;
        let expected = Checksum::from_sidecar(Algorithm::Sha256, &contents)?;
        Source::open(path, expected).await
    }

    /// Streams an artifact over HTTP(S).
    ///
    /// Without an explicit checksum the SHA-256 digest is fetched from `<url>.sha256`.
    pub async fn download(
        client: &reqwest::Client,
        url: &url::Url,
        expected: Option<Checksum>,
    ) -> Result<Self> {
        let expected = match expected {
            Some(c) => c,
            None => {
                let sidecar = format!("{}.sha256", url);
                debug!(%sidecar, "Fetching artifact checksum");
                let body = get(client, &sidecar)
                    .await?
                    .text()
                    .await
                    .map_err(|e| Error::Download {
                        url: sidecar.clone(),
                        source: e,
                    })?;
                Checksum::from_sidecar(Algorithm::Sha256, &body)?
            }
        };
        debug!(%url, "Downloading artifact");
        let response = get(client, url.as_str()).await?;
        let stream = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        );
        Ok(Source::new(url.to_string(), StreamReader::new(stream), expected))
    }

    /// Human readable name of the artifact (path or URL).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The checksum the artifact is expected to have.
    pub fn expected(&self) -> &Checksum {
        &self.expected
    }

    /// Hex digest of every byte read so far.
    pub fn actual_digest(&self) -> String {
        self.hasher.hex()
    }

    /// Whether the bytes read so far match the expected checksum.
    pub fn verify_checksum(&self) -> bool {
        self.actual_digest() == self.expected.digest
    }

    /// Builds the error reported when [`Source::verify_checksum`] fails.
    pub fn checksum_error(&self) -> Error {
        Error::ChecksumMismatch {
            expected: self.expected.to_string(),
            actual: format!("{}:{}", self.expected.algorithm, self.actual_digest()),
            source_name: self.name.clone(),
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("expected", &self.expected)
            .finish()
    }
}

impl AsyncRead for Source {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.reader).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = polled {
            this.hasher.update(&buf.filled()[before..]);
        }
        polled
    }
}

async fn get(client: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    let wrap = |e| Error::Download {
        url: url.to_string(),
        source: e,
    };
    client
        .get(url)
        .send()
        .await
        .map_err(wrap)?
        .error_for_status()
        .map_err(wrap)
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncReadExt;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn checksum_rejects_bad_digests() {
        assert!(Checksum::new(Algorithm::Sha256, "abc").is_err());
        assert!(Checksum::new(Algorithm::Sha256, &"z".repeat(64)).is_err());
        assert!(Checksum::new(Algorithm::Sha512, HELLO_SHA256).is_err());
        let checksum = Checksum::new(Algorithm::Sha256, &HELLO_SHA256.to_uppercase()).unwrap();
        assert_eq!(HELLO_SHA256, checksum.digest());
    }

    #[test]
    fn sidecar_ignores_file_name() {
        let line = format!("{}  kubelet\n", HELLO_SHA256);
        let checksum = Checksum::from_sidecar(Algorithm::Sha256, &line).unwrap();
        assert_eq!(format!("sha256:{}", HELLO_SHA256), checksum.to_string());
    }

    #[tokio::test]
    async fn verification_covers_bytes_read() {
        let expected = Checksum::new(Algorithm::Sha256, HELLO_SHA256).unwrap();
        let mut source = Source::from_bytes("hello", b"hello".to_vec(), expected);
        assert!(!source.verify_checksum(), "nothing read yet");
        let mut out = Vec::new();
        source.read_to_end(&mut out).await.unwrap();
        assert_eq!(b"hello".to_vec(), out);
        assert!(source.verify_checksum());
    }

    #[tokio::test]
    async fn mismatch_reports_both_digests() {
        let expected = Checksum::new(Algorithm::Sha256, HELLO_SHA256).unwrap();
        let mut source = Source::from_bytes("tampered", b"hellO".to_vec(), expected);
        let mut out = Vec::new();
        source.read_to_end(&mut out).await.unwrap();
        assert!(!source.verify_checksum());
        match source.checksum_error() {
            Error::ChecksumMismatch {
                expected,
                actual,
                source_name,
            } => {
                assert_eq!(format!("sha256:{}", HELLO_SHA256), expected);
                assert_ne!(expected, actual);
                assert_eq!("tampered", source_name);
            }
            e => panic!("unexpected error {:?}", e),
        }
    }

    #[tokio::test]
    async fn embedded_sources_verify() {
        let mut source = Source::embedded("unit", b"[Unit]\n");
        let mut out = Vec::new();
        source.read_to_end(&mut out).await.unwrap();
        assert!(source.verify_checksum());
    }

    #[tokio::test]
    async fn open_with_sidecar_reads_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello");
        tokio::fs::write(&path, "hello").await.unwrap();
        tokio::fs::write(dir.path().join("hello.sha256"), format!("{}  hello\n", HELLO_SHA256))
            .await
            .unwrap();
        let mut source = Source::open_with_sidecar(&path).await.unwrap();
        let mut out = Vec::new();
        source.read_to_end(&mut out).await.unwrap();
        assert!(source.verify_checksum());
    }
}
