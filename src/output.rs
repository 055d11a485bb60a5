//! Output of the validated payload.
//!
//! This is used by the one-shot command to write the current data set to
//! a file or standard output.

use std::{fs, io};
use std::io::Write;
use std::path::Path;
use log::error;
use tempfile::NamedTempFile;
use crate::error::Failed;
use crate::payload::PayloadSnapshot;


//------------ OutputFormat --------------------------------------------------

/// The format to output the payload set in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputFormat {
    /// RIPE NCC Validator style CSV.
    Csv,

    /// JSON format.
    Json,

    /// No output.
    None,
}

impl OutputFormat {
    /// The names of the formats as used on the command line.
    pub const NAMES: &'static [&'static str] = &["csv", "json", "none"];

    /// Returns the format for a command line argument.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "csv" => Some(OutputFormat::Csv),
            "json" => Some(OutputFormat::Json),
            "none" => Some(OutputFormat::None),
            _ => None
        }
    }

    /// Outputs a snapshot to the given target.
    ///
    /// If `target` is `None`, the data is written to standard output.
    /// Otherwise the file is replaced atomically: the data goes to a
    /// temporary file next to the target first.
    pub fn output(
        self,
        snapshot: &PayloadSnapshot,
        target: Option<&Path>,
    ) -> Result<(), Failed> {
        match target {
            Some(path) => self.output_file(snapshot, path),
            None => {
                let stdout = io::stdout();
                self.write(snapshot, &mut stdout.lock()).map_err(|err| {
                    error!("Failed to write to stdout: {}", err);
                    Failed
                })
            }
        }
    }

    /// Outputs a snapshot to a file.
    fn output_file(
        self,
        snapshot: &PayloadSnapshot,
        path: &Path,
    ) -> Result<(), Failed> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        if let Err(err) = fs::create_dir_all(dir) {
            error!(
                "Failed to create directory {}: {}", dir.display(), err
            );
            return Err(Failed)
        }
        let mut file = match NamedTempFile::new_in(dir) {
            Ok(file) => file,
            Err(err) => {
                error!(
                    "Failed to create temporary file in {}: {}",
                    dir.display(), err
                );
                return Err(Failed)
            }
        };
        if let Err(err) = self.write(snapshot, &mut file) {
            error!(
                "Failed to write output file {}: {}", path.display(), err
            );
            return Err(Failed)
        }
        if let Err(err) = file.persist(path) {
            error!(
                "Failed to move output file into place: {}", err
            );
            return Err(Failed)
        }
        Ok(())
    }

    /// Writes a snapshot in this format.
    fn write<W: io::Write>(
        self,
        snapshot: &PayloadSnapshot,
        target: &mut W,
    ) -> Result<(), io::Error> {
        match self {
            OutputFormat::Csv => Self::csv(snapshot, target),
            OutputFormat::Json => Self::json(snapshot, target),
            OutputFormat::None => Ok(())
        }
    }

    /// Writes a snapshot as CSV.
    fn csv<W: io::Write>(
        snapshot: &PayloadSnapshot,
        target: &mut W,
    ) -> Result<(), io::Error> {
        writeln!(target, "ASN,IP Prefix,Max Length,Trust Anchor")?;
        for (origin, info) in snapshot.origins() {
            writeln!(
                target, "{},{},{},{}",
                origin.as_id(),
                origin.prefix(),
                origin.max_length(),
                info.tal_name(),
            )?;
        }
        Ok(())
    }

    /// Writes a snapshot as JSON.
    fn json<W: io::Write>(
        snapshot: &PayloadSnapshot,
        target: &mut W,
    ) -> Result<(), io::Error> {
        writeln!(target, "{{\n  \"roas\": [")?;
        let mut first = true;
        for (origin, info) in snapshot.origins() {
            if !first {
                writeln!(target, ",")?;
            }
            first = false;
            write!(
                target,
                "    {{ \"asn\": \"{}\", \"prefix\": \"{}\", \
                 \"maxLength\": {}, \"ta\": \"{}\" }}",
                origin.as_id(),
                origin.prefix(),
                origin.max_length(),
                info.tal_name(),
            )?;
        }
        writeln!(target, "\n  ],")?;
        writeln!(target, "  \"routerKeys\": [")?;
        let mut first = true;
        for (key, info) in snapshot.router_keys() {
            if !first {
                writeln!(target, ",")?;
            }
            first = false;
            write!(
                target,
                "    {{ \"asn\": \"{}\", \"SKI\": \"{}\", \
                 \"routerPublicKey\": \"{}\", \"ta\": \"{}\" }}",
                key.as_id(),
                key.key_identifier(),
                base64::encode(key.key_info()),
                info.tal_name(),
            )?;
        }
        writeln!(target, "\n  ]\n}}")
    }
}


//============ Tests =========================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use rpki::repository::tal::TalInfo;
    use rpki::repository::x509::{Time, Validity};
    use crate::payload::{
        AddressPrefix, ObjectInfo, PayloadInfo, RouteOrigin
    };

    fn test_snapshot() -> PayloadSnapshot {
        let info = PayloadInfo::from(Arc::new(ObjectInfo {
            tal: TalInfo::from_name("testbed".into()).into_arc(),
            uri: None,
            validity: Validity::new(Time::now(), Time::now()),
        }));
        PayloadSnapshot::from_parts(
            vec![
                (
                    RouteOrigin::new(
                        64500.into(),
                        AddressPrefix::new("192.0.2.0".parse().unwrap(), 24),
                        24,
                    ),
                    info.clone()
                ),
                (
                    RouteOrigin::new(
                        64501.into(),
                        AddressPrefix::new("2001:db8::".parse().unwrap(), 32),
                        48,
                    ),
                    info
                ),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn csv_output() {
        let mut out = Vec::new();
        OutputFormat::Csv.write(&test_snapshot(), &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(
            out,
            "ASN,IP Prefix,Max Length,Trust Anchor\n\
             AS64500,192.0.2.0/24,24,testbed\n\
             AS64501,2001:db8::/32,48,testbed\n"
        );
    }

    #[test]
    fn json_output_is_wellformed() {
        let mut out = Vec::new();
        OutputFormat::Json.write(&test_snapshot(), &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("\"asn\": \"AS64500\""));
        assert!(out.contains("\"prefix\": \"2001:db8::/32\""));
        assert!(out.contains("\"routerKeys\": ["));
    }

    #[test]
    fn format_names() {
        assert_eq!(
            OutputFormat::from_name("csv"), Some(OutputFormat::Csv)
        );
        assert_eq!(
            OutputFormat::from_name("json"), Some(OutputFormat::Json)
        );
        assert!(OutputFormat::from_name("xml").is_none());
    }
}
