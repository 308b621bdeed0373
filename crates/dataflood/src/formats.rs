use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// String formats the inferrer can detect and the generator can produce.
/// `Hostname` is generation-only: it is never detected because too many
/// ordinary words would qualify.
#[derive(Debug, Deserialize, Serialize, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Format {
    Email,
    Uri,
    Uuid,
    #[serde(rename = "date-time", alias = "datetime")]
    DateTime,
    Date,
    Time,
    Ipv4,
    Ipv6,
    Hostname,
}

// Some are standard JSON-schema format regexes, some artisinally crafted.
lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("is a valid regex");
    static ref URI_RE: Regex =
        Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://[^\s]+$").expect("is a valid regex");
    static ref UUID_RE: Regex = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
    )
    .expect("is a valid regex");
    static ref DATE_TIME_RE: Regex = Regex::new(
        r"^\d{4}-\d{2}-\d{2}[Tt ]\d{2}:\d{2}:\d{2}(\.\d+)?([Zz]|[+-]\d{2}:\d{2})?$"
    )
    .expect("is a valid regex");
    static ref DATE_RE: Regex = Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("is a valid regex");
    static ref TIME_RE: Regex =
        Regex::new(r"^\d{2}:\d{2}:\d{2}(\.\d+)?$").expect("is a valid regex");
    static ref IPV4_RE: Regex = Regex::new(
        r"^((25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)$"
    )
    .expect("is a valid regex");
    static ref IPV6_RE: Regex =
        Regex::new(r"^([0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}$").expect("is a valid regex");
    static ref HOSTNAME_RE: Regex = Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$"
    )
    .expect("is a valid regex");
}

const EMAIL_NAMES: &[&str] = &[
    "alex", "casey", "jordan", "morgan", "riley", "sam", "taylor", "drew",
];
const DOMAINS: &[&str] = &[
    "example.com",
    "example.org",
    "mail.net",
    "acme.io",
    "northwind.dev",
];
const URI_PATHS: &[&str] = &["api", "v1", "items", "users", "reports", "docs", "status"];
const HOST_PREFIXES: &[&str] = &["host", "node", "web", "db", "app", "cache"];
const HOST_SUFFIXES: &[&str] = &["example.com", "internal.net", "local.io"];

impl Format {
    pub fn validate(&self, val: &str) -> bool {
        match self {
            Self::Email => EMAIL_RE.is_match(val),
            Self::Uri => URI_RE.is_match(val),
            Self::Uuid => UUID_RE.is_match(val),
            Self::DateTime => DATE_TIME_RE.is_match(val),
            Self::Date => DATE_RE.is_match(val),
            Self::Time => TIME_RE.is_match(val),
            Self::Ipv4 => IPV4_RE.is_match(val),
            Self::Ipv6 => IPV6_RE.is_match(val),
            Self::Hostname => HOSTNAME_RE.is_match(val),
        }
    }

    /// Detect the format matched by an arbitrary string, if any.
    /// Ordered so the most specific format wins.
    pub fn detect(val: &str) -> Option<Self> {
        // Detection order matters: date-time before date, ipv4 before
        // hostname-ish strings, and hostname never.
        [
            Self::Uuid,
            Self::DateTime,
            Self::Date,
            Self::Time,
            Self::Email,
            Self::Ipv4,
            Self::Ipv6,
            Self::Uri,
        ]
        .into_iter()
        .find(|f| f.validate(val))
    }

    /// Produce a value of this format from the generator's random stream.
    pub fn generate(&self, rng: &mut impl Rng) -> String {
        match self {
            Self::Email => {
                let name = EMAIL_NAMES[rng.gen_range(0..EMAIL_NAMES.len())];
                let domain = DOMAINS[rng.gen_range(0..DOMAINS.len())];
                format!("{name}{}@{domain}", rng.gen_range(1..1000))
            }
            Self::Uri => {
                let proto = if rng.gen_bool(0.7) { "https" } else { "http" };
                let domain = DOMAINS[rng.gen_range(0..DOMAINS.len())];
                let depth = rng.gen_range(1..=3);
                let path: Vec<&str> = (0..depth)
                    .map(|_| URI_PATHS[rng.gen_range(0..URI_PATHS.len())])
                    .collect();
                format!("{proto}://{domain}/{}", path.join("/"))
            }
            Self::Uuid => uuid::Builder::from_random_bytes(rng.gen())
                .into_uuid()
                .to_string(),
            Self::DateTime => {
                let formatted = Self::Date.generate(rng);
                format!(
                    "{formatted}T{:02}:{:02}:{:02}.000Z",
                    rng.gen_range(0..24),
                    rng.gen_range(0..60),
                    rng.gen_range(0..60),
                )
            }
            Self::Date => {
                // Uniform over 2000-01-01 .. 2030-01-01, rendered through a
                // real calendar so the day always exists.
                let epoch = rng.gen_range(946_684_800i64..1_893_456_000);
                let date = OffsetDateTime::from_unix_timestamp(epoch)
                    .expect("epoch range is valid")
                    .date();
                format!(
                    "{:04}-{:02}-{:02}",
                    date.year(),
                    u8::from(date.month()),
                    date.day()
                )
            }
            Self::Time => format!(
                "{:02}:{:02}:{:02}",
                rng.gen_range(0..24),
                rng.gen_range(0..60),
                rng.gen_range(0..60),
            ),
            Self::Ipv4 => {
                let octets: Vec<String> = (0..4)
                    .map(|_| rng.gen_range(1u32..255).to_string())
                    .collect();
                octets.join(".")
            }
            Self::Ipv6 => {
                let groups: Vec<String> = (0..8)
                    .map(|_| format!("{:x}", rng.gen_range(0u32..0x10000)))
                    .collect();
                groups.join(":")
            }
            Self::Hostname => {
                let prefix = HOST_PREFIXES[rng.gen_range(0..HOST_PREFIXES.len())];
                let suffix = HOST_SUFFIXES[rng.gen_range(0..HOST_SUFFIXES.len())];
                format!("{prefix}{}.{suffix}", rng.gen_range(1..100))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_format_cases() {
        for (format, value, expect) in [
            (Format::Email, "john@doe.com", true),
            (Format::Email, "john at doe.com", false),
            (Format::Uri, "https://example.org/a/b", true),
            (Format::Uri, "not a uri", false),
            (Format::Uuid, "df518555-34f0-446a-8788-7b36f607bbea", true),
            (Format::Uuid, "df518555", false),
            (Format::DateTime, "2022-09-11T10:31:25.123Z", true),
            (Format::DateTime, "2022-09-11", false),
            (Format::Date, "2022-09-11", true),
            (Format::Date, "2022-9-11", false),
            (Format::Time, "10:31:25", true),
            (Format::Time, "10:31", false),
            (Format::Ipv4, "123.45.6.78", true),
            (Format::Ipv4, "999.45.6.78", false),
            (Format::Ipv6, "2001:0db8:0000:0000:0000:ff00:0042:8329", true),
            (Format::Ipv6, "2001 db8", false),
            (Format::Hostname, "node7.example.com", true),
            (Format::Hostname, "host name", false),
        ] {
            assert_eq!(format.validate(value), expect, "{format:?} {value}");
        }
    }

    #[test]
    fn detection_prefers_the_specific_format() {
        assert_eq!(Format::detect("2022-09-11"), Some(Format::Date));
        assert_eq!(
            Format::detect("2022-09-11T10:31:25Z"),
            Some(Format::DateTime)
        );
        assert_eq!(Format::detect("10.0.0.1"), Some(Format::Ipv4));
        assert_eq!(Format::detect("jane@acme.io"), Some(Format::Email));
        assert_eq!(Format::detect("plain words"), None);
        // Hostname is generation-only.
        assert_eq!(Format::detect("web1.example.com"), None);
    }

    #[test]
    fn generated_values_validate() {
        let mut rng = StdRng::seed_from_u64(7);
        for format in [
            Format::Email,
            Format::Uri,
            Format::Uuid,
            Format::DateTime,
            Format::Date,
            Format::Time,
            Format::Ipv4,
            Format::Ipv6,
            Format::Hostname,
        ] {
            for _ in 0..50 {
                let v = format.generate(&mut rng);
                assert!(format.validate(&v), "{format:?} generated invalid {v:?}");
            }
        }
    }

    #[test]
    fn generation_is_deterministic_under_a_seed() {
        let a: Vec<String> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..10).map(|_| Format::Email.generate(&mut rng)).collect()
        };
        let b: Vec<String> = {
            let mut rng = StdRng::seed_from_u64(42);
            (0..10).map(|_| Format::Email.generate(&mut rng)).collect()
        };
        assert_eq!(a, b);
    }
}
