//! Update orchestration.
//!
//! One update pass fetches the index, compares the advertised checksums with
//! the local ones and fetches, erases or skips each resource accordingly.
//! Servers that predate the index get the legacy treatment: no attribute
//! configuration and an unconditional lineup fetch without identity.

use super::commit::{CommitError, CommitPayload, Committer};
use super::context::UpdaterContext;
use super::fetcher::Fetcher;
use super::resource::{
    IndexRequestInfo, ResourceInfo, ResourceKind, ResultCode, ATTRIBUTE_RESOURCE,
    CHANNEL_RESOURCE, INDEX_VERSION_TAG,
};
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, info, warn};
use vqec_common::ResourceVersion;

/// Results of one update pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOutcome {
    pub index: ResultCode,
    pub attr: ResultCode,
    pub chan: ResultCode,
}

/// Remote state advertised by the index
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedIndex {
    pub vcds_version: Option<String>,
    pub attribute: ResourceVersion,
    pub channel: ResourceVersion,
}

/// Parse an index body.
///
/// Each line is `<resource> <checksum>`, optionally preceded by
/// `vcds <version>`. Unknown resources are skipped; a resource with a
/// malformed checksum stays "not available".
pub fn parse_index(body: &[u8]) -> Result<ParsedIndex, CommitError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| CommitError::MalformedIndex("not valid UTF-8".to_string()))?;

    let mut index = ParsedIndex::default();
    for line in text.lines() {
        let line = line.trim();
        let Some((name, value)) = line.split_once(char::is_whitespace) else {
            if !line.is_empty() {
                debug!("Index line '{}' has no value, skipped", line);
            }
            continue;
        };
        let value = value.trim();

        let slot = match name {
            INDEX_VERSION_TAG => {
                index.vcds_version = Some(value.to_string());
                continue;
            }
            ATTRIBUTE_RESOURCE => &mut index.attribute,
            CHANNEL_RESOURCE => &mut index.channel,
            other => {
                debug!("Unknown index resource '{}', skipped", other);
                continue;
            }
        };
        match ResourceVersion::parse_checksum(value) {
            Some(version) => *slot = version,
            None => warn!("Index checksum '{}' for {} is malformed", value, name),
        }
    }
    Ok(index)
}

impl UpdaterContext {
    /// Run one update pass bounded by `deadline`
    pub fn request_update(
        &mut self,
        refresh_index: bool,
        update_attr: bool,
        update_chan: bool,
        deadline: Instant,
    ) -> UpdateOutcome {
        self.absorb_corruption();
        self.last_update_time = Some(Utc::now());

        let index = if refresh_index || self.last_index_request.result != ResultCode::Ok {
            self.fetch_index(deadline)
        } else {
            debug!("Using cached index from {:?}", self.last_index_request.server);
            ResultCode::Ok
        };
        let mut outcome = UpdateOutcome {
            index,
            ..UpdateOutcome::default()
        };

        if index.is_failure() && index != ResultCode::OldVersion {
            if update_attr {
                self.attrcfg.last_update_result = ResultCode::NotAttempted;
            }
            if update_chan {
                self.chancfg.last_update_result = ResultCode::NotAttempted;
            }
            self.publish();
            return outcome;
        }

        let legacy = index == ResultCode::OldVersion;
        if update_attr {
            outcome.attr = update_resource(
                &mut self.fetcher,
                &self.committer,
                &mut self.last_index_request,
                &mut self.attrcfg,
                ResourceKind::Attribute,
                legacy,
                deadline,
            );
        }
        if update_chan {
            outcome.chan = update_resource(
                &mut self.fetcher,
                &self.committer,
                &mut self.last_index_request,
                &mut self.chancfg,
                ResourceKind::Channel,
                legacy,
                deadline,
            );
        }

        info!(
            "Update pass: index {}, attributes {}, channels {}",
            outcome.index, outcome.attr, outcome.chan
        );
        self.publish();
        outcome
    }

    fn fetch_index(&mut self, deadline: Instant) -> ResultCode {
        self.total_index_attempts += 1;
        self.last_index_request.reset();
        // Absent from the index means the client must not use it
        self.attrcfg.remote_version = ResourceVersion::NotAvailable;
        self.chancfg.remote_version = ResourceVersion::NotAvailable;

        let mut parsed = None;
        let outcome = self.fetcher.fetch_resource(
            ResourceKind::Index,
            true,
            deadline,
            &mut self.last_index_request,
            &mut |body| {
                parsed = Some(parse_index(body)?);
                Ok(())
            },
        );

        if let Some(index) = parsed {
            self.attrcfg.remote_version = index.attribute;
            self.chancfg.remote_version = index.channel;
            self.last_index_request.vcds_version = index.vcds_version;
        }
        self.last_index_request.result = outcome.result;
        if outcome.result.is_failure() {
            self.total_index_failures += 1;
            warn!("Index request failed: {}", outcome.result);
        } else {
            info!(
                "Index from {}: attributes {}, channels {}",
                self.last_index_request
                    .server
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                self.attrcfg.remote_version,
                self.chancfg.remote_version
            );
        }
        outcome.result
    }
}

/// Bring one resource in line with the index
fn update_resource(
    fetcher: &mut Fetcher,
    committer: &Committer,
    index_request: &mut IndexRequestInfo,
    info: &mut ResourceInfo,
    kind: ResourceKind,
    legacy: bool,
    deadline: Instant,
) -> ResultCode {
    let result = match (legacy, kind) {
        (true, ResourceKind::Channel) => {
            fetch_and_commit(fetcher, committer, index_request, info, kind, false, deadline)
        }
        (true, _) => {
            if info.local_version == ResourceVersion::NotAvailable {
                ResultCode::Unnecessary
            } else {
                erase(committer, info, kind)
            }
        }
        (false, _) if info.local_version == info.remote_version => ResultCode::Unnecessary,
        (false, _) if info.remote_version == ResourceVersion::NotAvailable => {
            erase(committer, info, kind)
        }
        (false, _) => fetch_and_commit(fetcher, committer, index_request, info, kind, true, deadline),
    };

    info.record_attempt(result);
    debug!("{} update result: {}", kind, result);
    result
}

fn fetch_and_commit(
    fetcher: &mut Fetcher,
    committer: &Committer,
    index_request: &mut IndexRequestInfo,
    info: &mut ResourceInfo,
    kind: ResourceKind,
    use_identity: bool,
    deadline: Instant,
) -> ResultCode {
    let outcome = fetcher.fetch_resource(kind, use_identity, deadline, index_request, &mut |body| {
        committer.commit(kind, info, CommitPayload::Content(body))
    });
    if outcome.result == ResultCode::Ok {
        info.last_response_time = outcome.response_time;
    }
    outcome.result
}

fn erase(committer: &Committer, info: &mut ResourceInfo, kind: ResourceKind) -> ResultCode {
    match committer.commit(kind, info, CommitPayload::Erase) {
        Ok(()) => ResultCode::Ok,
        Err(e) => {
            warn!("Erase of {} failed: {}", kind, e);
            ResultCode::CommitError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATTR_SUM: &str = "f02d77ad5d121f00b124d4aa5651e2f8";
    const CHAN_SUM: &str = "e89ab785efbe3a674655b21e998ab5bd";

    #[test]
    fn test_parse_full_index() {
        let body = format!(
            "vcds 3.8.0\nvqec-network-cfg {}\nvqe-channels {}\n",
            ATTR_SUM, CHAN_SUM
        );
        let index = parse_index(body.as_bytes()).unwrap();
        assert_eq!(index.vcds_version.as_deref(), Some("3.8.0"));
        assert_eq!(index.attribute.as_str(), ATTR_SUM);
        assert_eq!(index.channel.as_str(), CHAN_SUM);
    }

    #[test]
    fn test_crlf_index_with_unknown_resource() {
        let body = format!(
            "vqe-channels {}\r\nunknown-resource <unknown version>\r\nvqec-network-cfg {}\r\n",
            CHAN_SUM, ATTR_SUM
        );
        let index = parse_index(body.as_bytes()).unwrap();
        assert_eq!(index.channel.as_str(), CHAN_SUM);
        assert_eq!(index.attribute.as_str(), ATTR_SUM);
    }

    #[test]
    fn test_missing_resource_is_not_available() {
        let body = format!("vqe-channels {}\n", CHAN_SUM);
        let index = parse_index(body.as_bytes()).unwrap();
        assert_eq!(index.attribute, ResourceVersion::NotAvailable);
        assert_eq!(index.channel.as_str(), CHAN_SUM);
        assert_eq!(index.vcds_version, None);
    }

    #[test]
    fn test_malformed_checksum_and_unknown_lines() {
        let body = format!(
            "vqec-network-cfg nothex\nfuture-resource {}\n\nvqe-channels {}\n",
            ATTR_SUM,
            CHAN_SUM.to_uppercase()
        );
        let index = parse_index(body.as_bytes()).unwrap();
        assert_eq!(index.attribute, ResourceVersion::NotAvailable);
        assert_eq!(index.channel.as_str(), CHAN_SUM);
    }

    #[test]
    fn test_non_utf8_index_rejected() {
        assert!(matches!(
            parse_index(&[0xff, 0x00]),
            Err(CommitError::MalformedIndex(_))
        ));
    }
}
