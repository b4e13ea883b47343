//! Timestamp arbitration for nicknames, channels and mode changes
//!
//! When two sides of the network disagree about a name, the older TS
//! wins. These decisions are pure functions so every branch of the
//! table is testable without sockets; the link layer applies them.

use crate::channel::MemberPrefix;

/// Resolution of a nickname collision between an existing user and an
/// inbound introduction for the same (case-folded) nick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NickCollision {
    /// Existing user is older: kill the remote copy back down the link,
    /// discard the introduction.
    KillRemote,
    /// Remote user is older: quit the existing user, accept the remote.
    KillLocal,
    /// Equal age: both copies die.
    KillBoth,
    /// Both records carry the same UID. UIDs are globally unique, so
    /// the introducing link is lying; drop it.
    ProtocolViolation,
}

/// Decide a nickname collision.
pub fn resolve_nick_collision(
    existing_ts: i64,
    remote_ts: i64,
    same_uid: bool,
) -> NickCollision {
    if same_uid {
        return NickCollision::ProtocolViolation;
    }
    match existing_ts.cmp(&remote_ts) {
        std::cmp::Ordering::Less => NickCollision::KillRemote,
        std::cmp::Ordering::Greater => NickCollision::KillLocal,
        std::cmp::Ordering::Equal => NickCollision::KillBoth,
    }
}

/// Outcome of comparing channel timestamps during an FJOIN merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMerge {
    /// Equal TS: union members and their prefix bits.
    MergeEqual,
    /// Remote is older: lower our TS, strip every local prefix, accept
    /// remote prefixes. The loser documents the strip with FMODE.
    WeLose,
    /// We are older: keep TS and prefixes; remote members still join but
    /// arrive stripped (their side performs the symmetric wipe).
    WeWin,
}

/// Decide a channel TS comparison. A locally unknown channel is treated
/// as maximally new, so the remote side's state is accepted wholesale.
pub fn compare_channel_ts(local_ts: Option<i64>, remote_ts: i64) -> ChannelMerge {
    match local_ts {
        None => ChannelMerge::WeLose,
        Some(ours) => match remote_ts.cmp(&ours) {
            std::cmp::Ordering::Equal => ChannelMerge::MergeEqual,
            std::cmp::Ordering::Less => ChannelMerge::WeLose,
            std::cmp::Ordering::Greater => ChannelMerge::WeWin,
        },
    }
}

/// The prefix bits a remote member keeps after the merge decision.
pub fn merged_member_prefix(merge: ChannelMerge, remote: MemberPrefix) -> MemberPrefix {
    match merge {
        // Winner ignores the loser's status claims.
        ChannelMerge::WeWin => MemberPrefix::NONE,
        ChannelMerge::MergeEqual | ChannelMerge::WeLose => remote,
    }
}

/// Disposition of an inbound FMODE against the target's TS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmodeMerge {
    /// Sender is older (or u-lined): honour the whole change.
    Accept,
    /// Equal TS: merge per mode letter (parametric via the handler's
    /// timestamp check, list modes union, simple modes as sent).
    MergePerMode,
    /// Sender is newer: bounce our reinforced state back, apply nothing,
    /// forward nothing.
    Bounce,
}

/// Decide an FMODE merge. U-lined sources always win.
pub fn compare_fmode_ts(local_ts: i64, remote_ts: i64, sender_is_uline: bool) -> FmodeMerge {
    if sender_is_uline {
        return FmodeMerge::Accept;
    }
    match remote_ts.cmp(&local_ts) {
        std::cmp::Ordering::Less => FmodeMerge::Accept,
        std::cmp::Ordering::Equal => FmodeMerge::MergePerMode,
        std::cmp::Ordering::Greater => FmodeMerge::Bounce,
    }
}
