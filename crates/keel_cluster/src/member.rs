//! Static cluster membership and per-peer position bookkeeping.

use anyhow::{ensure, Context};

use crate::bus::{ChannelUri, MediaBus, Publication};

/// Stable numeric member id; doubles as the index into the member table.
pub type MemberId = u32;

/// One row of the cluster member table.
#[derive(Debug)]
pub struct ClusterMember {
    pub id: MemberId,
    pub client_endpoint: String,
    pub member_endpoint: String,
    pub log_endpoint: String,
    /// Latest term position reported by this peer, if any.
    pub term_position: Option<u64>,
    pub voted_for_id: Option<MemberId>,
    pub is_leader: bool,
    /// Outgoing member-status publication; `None` for the local member.
    pub publication: Option<Publication>,
}

impl ClusterMember {
    fn new(id: MemberId, client: &str, member: &str, log: &str) -> Self {
        Self {
            id,
            client_endpoint: client.to_string(),
            member_endpoint: member.to_string(),
            log_endpoint: log.to_string(),
            term_position: None,
            voted_for_id: None,
            is_leader: false,
            publication: None,
        }
    }
}

/// Parse a `"id@client@member@log,…"` member string into a dense table.
pub fn parse_members(members: &str) -> anyhow::Result<Vec<ClusterMember>> {
    let mut table = Vec::new();
    for (index, part) in members.split(',').enumerate() {
        let fields: Vec<&str> = part.split('@').collect();
        ensure!(
            fields.len() == 4,
            "member entry needs id@client@member@log: {part:?}"
        );
        let id: MemberId = fields[0]
            .parse()
            .with_context(|| format!("bad member id in {part:?}"))?;
        ensure!(
            id as usize == index,
            "member ids must be dense and ordered: found {id} at index {index}"
        );
        table.push(ClusterMember::new(id, fields[1], fields[2], fields[3]));
    }
    ensure!(!table.is_empty(), "cluster member string is empty");
    Ok(table)
}

/// Members needed for agreement: ⌊n/2⌋ + 1.
pub fn quorum_threshold(member_count: usize) -> usize {
    member_count / 2 + 1
}

/// Largest term position reported by at least a quorum of members.
///
/// `ranked_positions` is the reusable descending-sort buffer; unreported
/// members rank as zero.
pub fn quorum_position(members: &[ClusterMember], ranked_positions: &mut Vec<u64>) -> u64 {
    ranked_positions.clear();
    ranked_positions.extend(members.iter().map(|m| m.term_position.unwrap_or(0)));
    ranked_positions.sort_unstable_by(|a, b| b.cmp(a));
    ranked_positions[quorum_threshold(members.len()) - 1]
}

/// Open a member-status publication to every peer's member-facing endpoint.
pub fn add_member_status_publications(
    members: &mut [ClusterMember],
    self_id: MemberId,
    status_channel: &str,
    stream_id: i32,
    bus: &MediaBus,
) -> anyhow::Result<()> {
    let template = ChannelUri::parse(status_channel)?;
    for member in members.iter_mut() {
        if member.id == self_id {
            continue;
        }
        let channel = template
            .clone()
            .with_endpoint(&member.member_endpoint)
            .to_string();
        member.publication = Some(bus.add_publication(&channel, stream_id)?);
    }
    Ok(())
}

pub fn are_publications_connected(members: &[ClusterMember]) -> bool {
    members
        .iter()
        .filter_map(|m| m.publication.as_ref())
        .all(Publication::is_connected)
}

pub fn become_candidate(members: &mut [ClusterMember], candidate_id: MemberId) {
    members[candidate_id as usize].voted_for_id = Some(candidate_id);
}

/// True while any member has not recorded a vote.
pub fn awaiting_votes(members: &[ClusterMember]) -> bool {
    members.iter().any(|m| m.voted_for_id.is_none())
}

pub fn reset_term_positions(members: &mut [ClusterMember]) {
    for member in members.iter_mut() {
        member.term_position = None;
    }
}

/// Members whose reported term position has reached `position`.
pub fn count_reached_position(members: &[ClusterMember], position: u64) -> usize {
    members
        .iter()
        .filter(|m| m.term_position.is_some_and(|p| p >= position))
        .count()
}

pub fn set_leader(members: &mut [ClusterMember], leader_id: MemberId) {
    for member in members.iter_mut() {
        member.is_leader = member.id == leader_id;
    }
}
