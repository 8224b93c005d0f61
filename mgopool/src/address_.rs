// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{Display, Formatter};

pub const DEFAULT_PORT: u16 = 27017;
const COLON_BYTES: usize = ':'.len_utf8();

/// A `host:port` pair the pool can dial.
///
/// Parsing from a string never fails: a missing or unparsable port falls back to
/// [`DEFAULT_PORT`].
///
/// ```
/// use mgopool::Address;
///
/// let address = Address::from("mongos-1.internal:27018");
/// assert_eq!(address.host(), "mongos-1.internal");
/// assert_eq!(address.port(), 27018);
/// assert_eq!(address.to_string(), "mongos-1.internal:27018");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.host.find(':').is_some() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<(String, u16)> for Address {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        Self {
            host: String::from(host),
            port,
        }
    }
}

fn parse_port(port: &str) -> u16 {
    port.parse().unwrap_or(DEFAULT_PORT)
}

fn parse(host: &str) -> (String, u16) {
    let host = host.trim();
    if let Some(pos_colon) = host.rfind(':') {
        if let Some(pos_bracket) = host.rfind(']') {
            if pos_bracket < pos_colon {
                // [IPv6]:port
                (
                    strip_brackets(&host[..pos_colon]),
                    parse_port(&host[pos_colon + COLON_BYTES..]),
                )
            } else {
                // [IPv6]
                (strip_brackets(host), DEFAULT_PORT)
            }
        } else if host[..pos_colon].rfind(':').is_some() {
            // bare IPv6
            (String::from(host), DEFAULT_PORT)
        } else {
            (
                String::from(&host[..pos_colon]),
                parse_port(&host[pos_colon + COLON_BYTES..]),
            )
        }
    } else {
        (String::from(host), DEFAULT_PORT)
    }
}

fn strip_brackets(host: &str) -> String {
    String::from(host.trim_start_matches('[').trim_end_matches(']'))
}

impl From<&str> for Address {
    fn from(host: &str) -> Self {
        let (host, port) = parse(host);
        Self { host, port }
    }
}

impl From<String> for Address {
    fn from(host: String) -> Self {
        Self::from(host.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("localhost", "localhost", DEFAULT_PORT)]
    #[case("localhost:27018", "localhost", 27018)]
    #[case(" localhost:27018 ", "localhost", 27018)]
    #[case("localhost:nope", "localhost", DEFAULT_PORT)]
    #[case("10.0.0.1:1234", "10.0.0.1", 1234)]
    #[case("[::1]:1234", "::1", 1234)]
    #[case("[::1]", "::1", DEFAULT_PORT)]
    #[case("::1", "::1", DEFAULT_PORT)]
    fn test_parse(#[case] input: &str, #[case] host: &str, #[case] port: u16) {
        let address = Address::from(input);
        assert_eq!(address.host(), host);
        assert_eq!(address.port(), port);
    }

    #[rstest]
    #[case(("localhost", 27017), "localhost:27017")]
    #[case(("::1", 27017), "[::1]:27017")]
    fn test_display(#[case] input: (&str, u16), #[case] expected: &str) {
        assert_eq!(Address::from(input).to_string(), expected);
    }

    #[rstest]
    fn test_display_round_trips_through_parse() {
        let address = Address::from(("::1", 1234));
        assert_eq!(Address::from(address.to_string()), address);
    }
}
