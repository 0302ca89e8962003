use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An inclusive range of TCP ports handed out to workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn parse(range_str: &str) -> Result<Self> {
        let Some((start, end)) = range_str.trim().split_once('-') else {
            anyhow::bail!(
                "Invalid port range format: {}. Expected START-END (e.g., 8100-8999)",
                range_str
            );
        };

        let start: u16 = start
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid start port: {}", start))?;
        let end: u16 = end
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid end port: {}", end))?;

        Self::new(start, end)
    }

    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 {
            anyhow::bail!("Invalid range: port 0 cannot be allocated");
        }
        if start > end {
            anyhow::bail!(
                "Invalid range: start ({}) must not exceed end ({})",
                start,
                end
            );
        }
        Ok(PortRange { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn size(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl TryFrom<String> for PortRange {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        PortRange::parse(&value).map_err(|e| e.to_string())
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_range() {
        let range = PortRange::parse("8100-8109").unwrap();
        assert_eq!(range.start, 8100);
        assert_eq!(range.end, 8109);
        assert_eq!(range.size(), 10);
    }

    #[test]
    fn test_single_port_range() {
        let range = PortRange::parse("8100-8100").unwrap();
        assert_eq!(range.size(), 1);
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![8100]);
    }

    #[test]
    fn test_parse_invalid_format() {
        assert!(PortRange::parse("8100").is_err());
        assert!(PortRange::parse("8100-8109-8110").is_err());
        assert!(PortRange::parse("invalid-range").is_err());
        assert!(PortRange::parse("8109-8100").is_err());
        assert!(PortRange::parse("0-10").is_err());
    }

    #[test]
    fn test_contains() {
        let range = PortRange::new(8100, 8109).unwrap();
        assert!(range.contains(8100));
        assert!(range.contains(8109));
        assert!(!range.contains(8110));
        assert!(!range.contains(8099));
    }

    #[test]
    fn test_full_u16_range_size() {
        let range = PortRange::new(1, u16::MAX).unwrap();
        assert_eq!(range.size(), 65535);
    }

    #[test]
    fn test_serde_as_string() {
        let range: PortRange = serde_json::from_str("\"8100-8199\"").unwrap();
        assert_eq!(range, PortRange::new(8100, 8199).unwrap());
        assert_eq!(serde_json::to_string(&range).unwrap(), "\"8100-8199\"");
        assert!(serde_json::from_str::<PortRange>("\"8199-8100\"").is_err());
    }
}
