//! Channel lineup database.
//!
//! A lineup is a concatenation of SDP session descriptions, one per channel,
//! each beginning with a `v=0` line. Parsing and validation happen without
//! touching the live database; only `commit_staged` swaps the active set.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::debug;

/// Default capacity of the channel database
pub const DEFAULT_MAX_CHANNELS: usize = 1000;

#[derive(Error, Debug, PartialEq)]
pub enum ChannelError {
    #[error("channel lineup is not valid UTF-8")]
    NotUtf8,

    #[error("channel lineup contains no session descriptions")]
    Empty,

    #[error("none of the {parsed} channels in the lineup passed validation")]
    NoValidChannels { parsed: usize },

    #[error("lineup has {count} channels, database capacity is {max}")]
    TooManyChannels { count: usize, max: usize },
}

/// One validated channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub name: String,
    pub addr: Ipv4Addr,
    pub port: u16,
    /// Source address for source-specific multicast, when given
    pub source: Option<Ipv4Addr>,
}

/// Lineup that passed validation and is waiting to be committed
#[derive(Debug, Clone, PartialEq)]
pub struct StagedLineup {
    channels: Vec<Channel>,
    parsed: usize,
}

impl StagedLineup {
    /// Lineup with no channels, used when the server withdraws the lineup
    pub fn empty() -> Self {
        Self {
            channels: Vec::new(),
            parsed: 0,
        }
    }

    pub fn parsed(&self) -> usize {
        self.parsed
    }

    pub fn validated(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }
}

/// Lineup statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineupStats {
    /// Sessions found in the last committed lineup
    pub parsed: usize,
    /// Sessions that passed validation
    pub validated: usize,
    /// Channels active in the database
    pub total: usize,
}

/// The live channel database
#[derive(Debug, Clone)]
pub struct ChannelDb {
    active: Vec<Channel>,
    stats: LineupStats,
    max_channels: usize,
}

impl Default for ChannelDb {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHANNELS)
    }
}

impl ChannelDb {
    pub fn new(max_channels: usize) -> Self {
        Self {
            active: Vec::new(),
            stats: LineupStats::default(),
            max_channels,
        }
    }

    /// Parse and validate a lineup without touching the database.
    ///
    /// A lineup larger than `max_channels` is rejected here so nothing is
    /// cached for a lineup the database could never hold.
    pub fn validate_and_stage(
        buf: &[u8],
        max_channels: usize,
    ) -> Result<StagedLineup, ChannelError> {
        let text = std::str::from_utf8(buf).map_err(|_| ChannelError::NotUtf8)?;
        let sessions = split_sessions(text);
        if sessions.is_empty() {
            return Err(ChannelError::Empty);
        }

        let mut seen = HashSet::new();
        let mut channels = Vec::new();
        for (i, session) in sessions.iter().enumerate() {
            match parse_session(session) {
                Some(channel) => {
                    if seen.insert((channel.addr, channel.port)) {
                        channels.push(channel);
                    } else {
                        debug!(
                            "Session {} duplicates {}:{}, skipped",
                            i, channel.addr, channel.port
                        );
                    }
                }
                None => debug!("Session {} failed validation", i),
            }
        }

        if channels.is_empty() {
            return Err(ChannelError::NoValidChannels {
                parsed: sessions.len(),
            });
        }

        if channels.len() > max_channels {
            return Err(ChannelError::TooManyChannels {
                count: channels.len(),
                max: max_channels,
            });
        }

        Ok(StagedLineup {
            channels,
            parsed: sessions.len(),
        })
    }

    /// Replace the active lineup with a staged one
    pub fn commit_staged(&mut self, staged: StagedLineup) -> Result<LineupStats, ChannelError> {
        if staged.channels.len() > self.max_channels {
            return Err(ChannelError::TooManyChannels {
                count: staged.channels.len(),
                max: self.max_channels,
            });
        }

        self.stats = LineupStats {
            parsed: staged.parsed,
            validated: staged.channels.len(),
            total: staged.channels.len(),
        };
        self.active = staged.channels;
        Ok(self.stats)
    }

    pub fn stats(&self) -> LineupStats {
        self.stats
    }

    pub fn channels(&self) -> &[Channel] {
        &self.active
    }

    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    pub fn set_max_channels(&mut self, max_channels: usize) {
        self.max_channels = max_channels;
    }
}

/// Split a lineup into per-session line groups at each `v=` line
fn split_sessions(text: &str) -> Vec<Vec<&str>> {
    let mut sessions: Vec<Vec<&str>> = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with("v=") {
            sessions.push(vec![line]);
        } else if let Some(current) = sessions.last_mut() {
            current.push(line);
        }
    }
    sessions
}

fn parse_session(lines: &[&str]) -> Option<Channel> {
    if lines.first()?.trim_start_matches("v=") != "0" {
        return None;
    }

    let mut name = None;
    let mut addr = None;
    let mut port = None;
    let mut source = None;

    for line in &lines[1..] {
        if let Some(value) = line.strip_prefix("s=") {
            let value = value.trim();
            if !value.is_empty() {
                name = Some(value.to_string());
            }
        } else if let Some(value) = line.strip_prefix("c=") {
            // c=IN IP4 239.1.1.1/255
            let mut fields = value.split_whitespace();
            if fields.next() == Some("IN") && fields.next() == Some("IP4") {
                addr = fields
                    .next()
                    .and_then(|a| a.split('/').next())
                    .and_then(|a| a.parse::<Ipv4Addr>().ok());
            }
        } else if let Some(value) = line.strip_prefix("m=video ") {
            // m=video 50000 RTP/AVP 96
            port = value
                .split_whitespace()
                .next()
                .and_then(|p| p.split('/').next())
                .and_then(|p| p.parse::<u16>().ok())
                .filter(|p| *p != 0);
        } else if let Some(value) = line.strip_prefix("a=source-filter:") {
            // a=source-filter: incl IN IP4 239.1.1.1 10.0.0.1
            source = value
                .split_whitespace()
                .nth(4)
                .and_then(|a| a.parse::<Ipv4Addr>().ok());
        }
    }

    Some(Channel {
        name: name?,
        addr: addr?,
        port: port?,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lineup(channels: &[(&str, &str, u16)]) -> String {
        channels
            .iter()
            .map(|(name, addr, port)| {
                format!(
                    "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns={}\r\nc=IN IP4 {}/255\r\nt=0 0\r\nm=video {} RTP/AVP 96\r\n",
                    name, addr, port
                )
            })
            .collect()
    }

    fn stage(buf: &str) -> StagedLineup {
        ChannelDb::validate_and_stage(buf.as_bytes(), DEFAULT_MAX_CHANNELS).unwrap()
    }

    #[test]
    fn test_validate_well_formed_lineup() {
        let buf = lineup(&[("News", "239.1.1.1", 50000), ("Sports", "239.1.1.2", 50000)]);
        let staged = stage(&buf);
        assert_eq!(staged.parsed(), 2);
        assert_eq!(staged.validated(), 2);
        assert_eq!(staged.channels()[1].name, "Sports");
        assert_eq!(staged.channels()[0].addr, Ipv4Addr::new(239, 1, 1, 1));
    }

    #[test]
    fn test_invalid_sessions_are_counted_but_dropped() {
        let mut buf = lineup(&[("News", "239.1.1.1", 50000)]);
        buf.push_str("v=0\r\ns=Broken\r\nc=IN IP4 not-an-address\r\nm=video 5000 RTP/AVP 96\r\n");
        buf.push_str(&lineup(&[("Dup", "239.1.1.1", 50000)]));

        let staged = stage(&buf);
        assert_eq!(staged.parsed(), 3);
        assert_eq!(staged.validated(), 1);
    }

    #[test]
    fn test_reject_empty_and_garbage() {
        assert_eq!(
            ChannelDb::validate_and_stage(b"", DEFAULT_MAX_CHANNELS).unwrap_err(),
            ChannelError::Empty
        );
        assert_eq!(
            ChannelDb::validate_and_stage(b"v=0\r\ns=No address\r\n", DEFAULT_MAX_CHANNELS)
                .unwrap_err(),
            ChannelError::NoValidChannels { parsed: 1 }
        );
        assert_eq!(
            ChannelDb::validate_and_stage(&[0xff, 0xfe], DEFAULT_MAX_CHANNELS).unwrap_err(),
            ChannelError::NotUtf8
        );
    }

    #[test]
    fn test_source_filter() {
        let buf = "v=0\ns=SSM\nc=IN IP4 232.1.1.1\na=source-filter: incl IN IP4 232.1.1.1 10.1.1.1\nm=video 6000 RTP/AVP 96\n";
        let staged = stage(buf);
        assert_eq!(staged.channels()[0].source, Some(Ipv4Addr::new(10, 1, 1, 1)));
    }

    #[test]
    fn test_commit_replaces_active_set() {
        let mut db = ChannelDb::default();
        let first = stage(&lineup(&[("A", "239.0.0.1", 5000), ("B", "239.0.0.2", 5000)]));
        db.commit_staged(first).unwrap();
        assert_eq!(db.channels().len(), 2);

        let second = stage(&lineup(&[("C", "239.0.0.3", 5000)]));
        let stats = db.commit_staged(second).unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(db.channels()[0].name, "C");
    }

    #[test]
    fn test_commit_respects_capacity() {
        let mut db = ChannelDb::new(1);
        let staged = stage(&lineup(&[("A", "239.0.0.1", 5000), ("B", "239.0.0.2", 5000)]));
        assert_eq!(
            db.commit_staged(staged).unwrap_err(),
            ChannelError::TooManyChannels { count: 2, max: 1 }
        );
        assert!(db.channels().is_empty());
    }

    #[test]
    fn test_stage_rejects_oversized_lineup() {
        let buf = lineup(&[("A", "239.0.0.1", 5000), ("B", "239.0.0.2", 5000)]);
        assert_eq!(
            ChannelDb::validate_and_stage(buf.as_bytes(), 1).unwrap_err(),
            ChannelError::TooManyChannels { count: 2, max: 1 }
        );
        assert_eq!(ChannelDb::validate_and_stage(buf.as_bytes(), 2).unwrap().validated(), 2);
    }

    #[test]
    fn test_commit_empty_lineup_clears_database() {
        let mut db = ChannelDb::default();
        db.commit_staged(stage(&lineup(&[("A", "239.0.0.1", 5000)])))
            .unwrap();
        db.commit_staged(StagedLineup::empty()).unwrap();
        assert_eq!(db.stats(), LineupStats::default());
    }
}
