// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Built-in operation catalogue.
//!
//! A small set of encodings, digests and codecs that make the gateway usable
//! without an external engine. Each operation delegates to its crate.

use super::{ArgSpec, EngineError, OperationDescriptor, OperationEngine, OperationOutput};
use crate::value::ArgValue;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256, Sha512};
use std::io::{Read, Write};

const MAX_BLAKE3_OUTPUT: usize = 1024;

/// Engine backed by `base64`, `hex`, `url`, `sha2`, `blake3` and `flate2`.
#[derive(Debug, Clone)]
pub struct BuiltinEngine {
    catalogue: Vec<OperationDescriptor>,
}

impl Default for BuiltinEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinEngine {
    pub fn new() -> Self {
        let op = |name: &str, description: &str, args: Vec<ArgSpec>| OperationDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            args,
        };

        let catalogue = vec![
            op(
                "To Base64",
                "Encodes raw data into a Base64 ASCII string",
                vec![ArgSpec::option("Alphabet", &["Standard", "URL safe"])],
            ),
            op(
                "From Base64",
                "Decodes a Base64 string back into raw data",
                vec![ArgSpec::option("Alphabet", &["Standard", "URL safe"])],
            ),
            op(
                "To Hex",
                "Converts data into a hexadecimal byte string",
                vec![ArgSpec::boolean("Uppercase", false)],
            ),
            op("From Hex", "Converts a hexadecimal byte string back into raw data", vec![]),
            op(
                "URL Encode",
                "Percent-encodes data for use in URL query strings",
                vec![],
            ),
            op("URL Decode", "Decodes percent-encoded URL data", vec![]),
            op("To Upper case", "Converts text to upper case", vec![]),
            op("To Lower case", "Converts text to lower case", vec![]),
            op(
                "SHA2",
                "Computes a SHA-2 message digest",
                vec![ArgSpec::option("Size", &["256", "512"])],
            ),
            op(
                "BLAKE3",
                "Computes a BLAKE3 hash with a configurable output length in bytes",
                vec![ArgSpec::number("Size", 32.0)],
            ),
            op(
                "Gzip",
                "Compresses data with gzip",
                vec![ArgSpec::option("Compression level", &["Default", "Fastest", "Best"])],
            ),
            op("Gunzip", "Decompresses gzip data", vec![]),
        ];

        Self { catalogue }
    }
}

impl OperationEngine for BuiltinEngine {
    fn execute(
        &self,
        operation: &str,
        input: &[u8],
        args: &[ArgValue],
    ) -> Result<OperationOutput, EngineError> {
        match operation {
            "To Base64" => {
                let encoded = match alphabet(args)? {
                    Alphabet::Standard => STANDARD.encode(input),
                    Alphabet::UrlSafe => URL_SAFE.encode(input),
                };
                Ok(OperationOutput::text(encoded))
            }
            "From Base64" => {
                let decoded = match alphabet(args)? {
                    Alphabet::Standard => STANDARD.decode(input),
                    Alphabet::UrlSafe => URL_SAFE.decode(input),
                }
                .map_err(|e| EngineError::InvalidInput(format!("invalid base64: {}", e)))?;
                Ok(OperationOutput::bytes(decoded))
            }
            "To Hex" => {
                let uppercase = bool_arg(args, 0, "Uppercase", false)?;
                let encoded = if uppercase {
                    hex::encode_upper(input)
                } else {
                    hex::encode(input)
                };
                Ok(OperationOutput::text(encoded))
            }
            "From Hex" => hex::decode(input)
                .map(OperationOutput::bytes)
                .map_err(|e| EngineError::InvalidInput(format!("invalid hex string: {}", e))),
            "URL Encode" => Ok(OperationOutput::text(
                url::form_urlencoded::byte_serialize(input).collect::<String>(),
            )),
            "URL Decode" => Ok(OperationOutput {
                value: percent_decode(input),
                data_type: super::DataType::String,
            }),
            "To Upper case" => Ok(OperationOutput::text(
                String::from_utf8_lossy(input).to_uppercase(),
            )),
            "To Lower case" => Ok(OperationOutput::text(
                String::from_utf8_lossy(input).to_lowercase(),
            )),
            "SHA2" => {
                let digest = match str_arg(args, 0, "Size", "256")? {
                    "256" => hex::encode(Sha256::digest(input)),
                    "512" => hex::encode(Sha512::digest(input)),
                    other => {
                        return Err(EngineError::InvalidArgument {
                            name: "Size".to_string(),
                            reason: format!("unsupported digest size {}", other),
                        })
                    }
                };
                Ok(OperationOutput::text(digest))
            }
            "BLAKE3" => {
                let size = number_arg(args, 0, "Size", 32.0)?;
                if size.fract() != 0.0 || size < 1.0 || size > MAX_BLAKE3_OUTPUT as f64 {
                    return Err(EngineError::InvalidArgument {
                        name: "Size".to_string(),
                        reason: format!("must be a whole number between 1 and {}", MAX_BLAKE3_OUTPUT),
                    });
                }
                let mut out = vec![0u8; size as usize];
                let mut hasher = blake3::Hasher::new();
                hasher.update(input);
                hasher.finalize_xof().fill(&mut out);
                Ok(OperationOutput::text(hex::encode(out)))
            }
            "Gzip" => {
                let level = match str_arg(args, 0, "Compression level", "Default")? {
                    "Fastest" => Compression::fast(),
                    "Best" => Compression::best(),
                    _ => Compression::default(),
                };
                let mut encoder = GzEncoder::new(Vec::new(), level);
                encoder
                    .write_all(input)
                    .and_then(|_| encoder.finish())
                    .map(OperationOutput::bytes)
                    .map_err(|e| EngineError::Failed(format!("gzip failed: {}", e)))
            }
            "Gunzip" => {
                let mut decoder = GzDecoder::new(input);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| EngineError::InvalidInput(format!("invalid gzip data: {}", e)))?;
                Ok(OperationOutput::bytes(out))
            }
            other => Err(EngineError::NotFound(other.to_string())),
        }
    }

    fn operations(&self) -> Vec<OperationDescriptor> {
        self.catalogue.clone()
    }

    fn describe(&self, operation: &str) -> Option<OperationDescriptor> {
        self.catalogue.iter().find(|d| d.name == operation).cloned()
    }
}

enum Alphabet {
    Standard,
    UrlSafe,
}

fn alphabet(args: &[ArgValue]) -> Result<Alphabet, EngineError> {
    match str_arg(args, 0, "Alphabet", "Standard")? {
        "Standard" => Ok(Alphabet::Standard),
        "URL safe" => Ok(Alphabet::UrlSafe),
        other => Err(EngineError::InvalidArgument {
            name: "Alphabet".to_string(),
            reason: format!("unknown alphabet {}", other),
        }),
    }
}

fn str_arg<'a>(
    args: &'a [ArgValue],
    index: usize,
    name: &str,
    default: &'a str,
) -> Result<&'a str, EngineError> {
    match args.get(index) {
        None => Ok(default),
        Some(value) => value.as_str().ok_or_else(|| type_error(name, "string", value)),
    }
}

fn bool_arg(args: &[ArgValue], index: usize, name: &str, default: bool) -> Result<bool, EngineError> {
    match args.get(index) {
        None => Ok(default),
        Some(value) => value.as_bool().ok_or_else(|| type_error(name, "boolean", value)),
    }
}

fn number_arg(args: &[ArgValue], index: usize, name: &str, default: f64) -> Result<f64, EngineError> {
    match args.get(index) {
        None => Ok(default),
        Some(value) => value.as_f64().ok_or_else(|| type_error(name, "number", value)),
    }
}

fn type_error(name: &str, expected: &str, got: &ArgValue) -> EngineError {
    EngineError::InvalidArgument {
        name: name.to_string(),
        reason: format!("expected {}, got {}", expected, got.type_name()),
    }
}

/// Percent-decoding matching `form_urlencoded` output: `+` is a space and
/// malformed escapes pass through untouched.
fn percent_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < input.len() => {
                match (hex_val(input[i + 1]), hex_val(input[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    out
}

fn hex_val(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
