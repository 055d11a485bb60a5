//! Trust Anchor Locators.
//!
//! A trust anchor locator is a small text file that names the location of
//! a trust anchor certificate together with the public key that certificate
//! must carry. This module contains the type [`Tal`] for a locator loaded
//! from a file as well as [`TalUri`] for the mixed rsync/HTTPS URIs such a
//! file may contain.

use std::{fmt, fs, io};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use bytes::Bytes;
use rand::Rng;
use rand::seq::SliceRandom;
use rpki::repository::crypto::keys::PublicKey;
use rpki::repository::tal::TalInfo;
use rpki::uri;


//------------ Tal -----------------------------------------------------------

/// A trust anchor locator.
#[derive(Clone, Debug)]
pub struct Tal {
    /// The URIs the trust anchor certificate can be fetched from.
    ///
    /// The order of the URIs is the order of preference given in the TAL
    /// file. The sequence is never empty.
    uris: Vec<TalUri>,

    /// The subject public key info the certificate must contain.
    key_info: PublicKey,

    /// Information shared by all data derived from this TAL.
    info: Arc<TalInfo>,
}

impl Tal {
    /// Loads a TAL from the file at the given path.
    ///
    /// The TAL’s name is derived from the file name with the extension
    /// removed.
    pub fn load(path: &Path) -> Result<Self, ReadError> {
        let name = path.file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::read(name, &mut fs::File::open(path)?)
    }

    /// Reads a TAL with the given name from a reader.
    pub fn read<R: Read>(
        name: String, reader: &mut R
    ) -> Result<Self, ReadError> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        if data.is_empty() {
            return Err(ReadError::Empty)
        }

        let mut data = data.as_slice();

        // Zero or more comment lines.
        let mut line = Self::take_line(&mut data)?;
        while line.first() == Some(&b'#') {
            line = Self::take_line(&mut data)?;
        }

        // One or more URI lines followed by exactly one empty line.
        if line.is_empty() {
            return Err(ReadError::MissingUri)
        }
        let mut uris = vec![TalUri::from_slice(line)?];
        loop {
            let line = Self::take_line(&mut data)?;
            if line.is_empty() {
                break
            }
            uris.push(TalUri::from_slice(line)?);
        }

        // The rest is the base64 encoded subject public key info. The
        // encoder may have broken it into lines of any length, so throw
        // out all white space before decoding.
        let encoded: Vec<u8> = data.iter().filter(|ch| {
            !ch.is_ascii_whitespace()
        }).copied().collect();
        let key_info = Bytes::from(base64::decode(&encoded)?);
        let key_info = PublicKey::decode(key_info.as_ref()).map_err(|_| {
            ReadError::BadKeyInfo
        })?;

        Ok(Tal {
            uris,
            key_info,
            info: TalInfo::from_name(name).into_arc(),
        })
    }

    /// Takes the next line off the front of `data`.
    ///
    /// The line is returned without its terminating line feed and without a
    /// possible carriage return before that. Data that isn’t terminated by
    /// a line feed is an error: a correct TAL always continues after the
    /// URI block.
    fn take_line<'a>(data: &mut &'a [u8]) -> Result<&'a [u8], ReadError> {
        let mut split = data.splitn(2, |&ch| ch == b'\n');
        let line = split.next().ok_or(ReadError::UnexpectedEof)?;
        *data = split.next().ok_or(ReadError::UnexpectedEof)?;
        if line.last() == Some(&b'\r') {
            Ok(&line[..line.len() - 1])
        }
        else {
            Ok(line)
        }
    }

    /// Shuffles the order of the URIs.
    ///
    /// This performs a Fisher-Yates shuffle, so with a seeded RNG the
    /// resulting order is reproducible.
    pub fn shuffle_uris<R: Rng>(&mut self, rng: &mut R) {
        self.uris.shuffle(rng)
    }
}

impl Tal {
    /// Returns an iterator over the URIs of the TAL.
    pub fn uris(&self) -> ::std::slice::Iter<TalUri> {
        self.uris.iter()
    }

    /// Returns a reference to the expected public key.
    pub fn key_info(&self) -> &PublicKey {
        &self.key_info
    }

    /// Returns a reference to the TAL info.
    pub fn info(&self) -> &Arc<TalInfo> {
        &self.info
    }

    /// Returns the name of the TAL.
    pub fn name(&self) -> &str {
        self.info.name()
    }
}


//------------ TalUri --------------------------------------------------------

/// A URI of the trust anchor certificate.
///
/// RFC 8630 allows both rsync and HTTPS URIs in a TAL. Everything else is
/// rejected when reading the TAL.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum TalUri {
    Rsync(uri::Rsync),
    Https(uri::Https),
}

impl TalUri {
    /// Creates a TAL URI from a bytes slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, ReadError> {
        if slice.starts_with(b"rsync://") {
            Ok(TalUri::Rsync(uri::Rsync::from_slice(slice)?))
        }
        else if slice.starts_with(b"https://") {
            Ok(TalUri::Https(uri::Https::from_slice(slice)?))
        }
        else {
            Err(ReadError::UnsupportedScheme)
        }
    }

    /// Returns whether the URI is an rsync URI.
    pub fn is_rsync(&self) -> bool {
        matches!(*self, TalUri::Rsync(_))
    }

    /// Returns whether the path of the URI ends in `.cer`.
    pub fn is_cer_file(&self) -> bool {
        match *self {
            TalUri::Rsync(ref uri) => uri.ends_with(".cer"),
            TalUri::Https(ref uri) => uri.as_str().ends_with(".cer"),
        }
    }
}

impl fmt::Display for TalUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TalUri::Rsync(ref uri) => uri.fmt(f),
            TalUri::Https(ref uri) => uri.fmt(f),
        }
    }
}


//------------ ReadError -----------------------------------------------------

/// An error happened while reading a TAL.
#[derive(Debug)]
pub enum ReadError {
    /// Reading the file failed.
    Io(io::Error),

    /// The file was empty.
    Empty,

    /// The first line after the comments is empty, i.e., there is no URI.
    MissingUri,

    /// The file ended before the URI block was terminated by a blank line.
    UnexpectedEof,

    /// A URI uses a scheme other than rsync or HTTPS.
    UnsupportedScheme,

    /// A URI could not be parsed.
    BadUri(uri::Error),

    /// The key info was not correctly encoded in base64.
    BadKeyInfoEncoding(base64::DecodeError),

    /// The key info did not decode as a subject public key info.
    BadKeyInfo,
}

impl From<io::Error> for ReadError {
    fn from(err: io::Error) -> ReadError {
        ReadError::Io(err)
    }
}

impl From<uri::Error> for ReadError {
    fn from(err: uri::Error) -> ReadError {
        ReadError::BadUri(err)
    }
}

impl From<base64::DecodeError> for ReadError {
    fn from(err: base64::DecodeError) -> ReadError {
        ReadError::BadKeyInfoEncoding(err)
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ReadError::Io(ref err) => err.fmt(f),
            ReadError::Empty => f.write_str("empty file"),
            ReadError::MissingUri => {
                f.write_str("no URI in the first line after the comments")
            }
            ReadError::UnexpectedEof => {
                f.write_str("unexpected end of file in the URI block")
            }
            ReadError::UnsupportedScheme => {
                f.write_str("URI with a scheme other than rsync or https")
            }
            ReadError::BadUri(ref err) => {
                write!(f, "bad trust anchor URI: {}", err)
            }
            ReadError::BadKeyInfoEncoding(ref err) => {
                write!(f, "bad key info: {}", err)
            }
            ReadError::BadKeyInfo => f.write_str("bad key info"),
        }
    }
}

impl std::error::Error for ReadError { }


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    // A well-formed ECDSA P-256 subject public key info.
    const KEY_INFO: &str =
        "MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEAQIDBAUGBwgJCgsMDQ4PEBESExQV\n\
         FhcYGRobHB0eHyAhIiMkJSYnKCkqKywtLi8wMTIzNDU2Nzg5Ojs8PT4/QA==\n";

    fn read(data: &str) -> Result<Tal, ReadError> {
        Tal::read("test".into(), &mut data.as_bytes())
    }

    fn good_tal() -> String {
        format!(
            "# A comment.\n# Another comment.\n\
             rsync://example.com/ta/root.cer\n\
             https://example.com/ta/root.cer\n\
             \n{}",
            KEY_INFO
        )
    }

    #[test]
    fn read_good_tal() {
        let tal = read(&good_tal()).unwrap();
        assert_eq!(tal.uris().len(), 2);
        assert!(tal.uris[0].is_rsync());
        assert!(!tal.uris[1].is_rsync());
        assert!(tal.uris[0].is_cer_file());
        assert_eq!(tal.name(), "test");
    }

    #[test]
    fn read_good_tal_without_comments() {
        let tal = read(
            &format!("rsync://example.com/ta/root.cer\n\n{}", KEY_INFO)
        ).unwrap();
        assert_eq!(tal.uris().len(), 1);
    }

    #[test]
    fn read_empty_file() {
        assert!(matches!(read(""), Err(ReadError::Empty)));
    }

    #[test]
    fn read_missing_uri() {
        assert!(matches!(
            read(&format!("# comment\n\n{}", KEY_INFO)),
            Err(ReadError::MissingUri)
        ));
    }

    #[test]
    fn read_eof_in_uri_block() {
        assert!(matches!(
            read("# comment\nrsync://example.com/ta/root.cer\n"),
            Err(ReadError::UnexpectedEof)
        ));
        assert!(matches!(
            read("# comment\n"),
            Err(ReadError::UnexpectedEof)
        ));
    }

    #[test]
    fn read_unsupported_scheme() {
        assert!(matches!(
            read(&format!("ftp://example.com/root.cer\n\n{}", KEY_INFO)),
            Err(ReadError::UnsupportedScheme)
        ));
    }

    #[test]
    fn read_bad_base64() {
        assert!(matches!(
            read("rsync://example.com/ta/root.cer\n\nnot&base64!\n"),
            Err(ReadError::BadKeyInfoEncoding(_))
        ));
    }

    #[test]
    fn read_bad_key_info() {
        // Valid base64 that isn’t DER.
        assert!(matches!(
            read("rsync://example.com/ta/root.cer\n\nAAAA\n"),
            Err(ReadError::BadKeyInfo)
        ));
    }

    #[test]
    fn shuffle_is_permutation() {
        let mut tal = read(
            &format!(
                "rsync://example.com/a.cer\nrsync://example.com/b.cer\n\
                 rsync://example.com/c.cer\nrsync://example.com/d.cer\n\
                 \n{}",
                KEY_INFO
            )
        ).unwrap();
        let before = tal.uris.clone();
        tal.shuffle_uris(&mut StdRng::seed_from_u64(10));
        let mut sorted_before: Vec<_> = before.iter().map(|uri| {
            uri.to_string()
        }).collect();
        let mut sorted_after: Vec<_> = tal.uris.iter().map(|uri| {
            uri.to_string()
        }).collect();
        sorted_before.sort();
        sorted_after.sort();
        assert_eq!(sorted_before, sorted_after);
    }

    #[test]
    fn shuffle_is_deterministic() {
        let tal = read(
            &format!(
                "rsync://example.com/a.cer\nrsync://example.com/b.cer\n\
                 rsync://example.com/c.cer\nrsync://example.com/d.cer\n\
                 \n{}",
                KEY_INFO
            )
        ).unwrap();
        let mut first = tal.clone();
        let mut second = tal;
        first.shuffle_uris(&mut StdRng::seed_from_u64(4711));
        second.shuffle_uris(&mut StdRng::seed_from_u64(4711));
        assert_eq!(first.uris, second.uris);
    }
}
