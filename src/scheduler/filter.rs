//! Candidate filtering for scraped members.

use chrono::{DateTime, Utc};

use crate::config::LastSeenFilter;
use crate::telegram::{LastSeen, Member};

/// Days since the member was last online, bucketed the way Telegram
/// reports coarse statuses. `None` means the status is hidden.
fn last_seen_age_days(last_seen: &LastSeen, now: DateTime<Utc>) -> Option<i64> {
    match last_seen {
        LastSeen::Online => Some(0),
        LastSeen::Recently => Some(1),
        LastSeen::LastWeek => Some(7),
        LastSeen::LastMonth => Some(30),
        LastSeen::At(when) => Some((now - *when).num_days().max(0)),
        LastSeen::Hidden => None,
    }
}

/// Whether a scraped member should be offered an invite at all.
///
/// Bots, deleted accounts and anything Telegram has flagged as scam or
/// fake are always rejected. When an activity filter is set, members
/// with a hidden last-seen status are rejected too.
#[must_use]
pub fn member_invitable(member: &Member, filter: LastSeenFilter, now: DateTime<Utc>) -> bool {
    if member.bot || member.deleted || member.scam || member.fake {
        return false;
    }
    match filter.max_age_days() {
        None => true,
        Some(max_days) => {
            last_seen_age_days(&member.last_seen, now).is_some_and(|days| days <= max_days)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn member(last_seen: LastSeen) -> Member {
        Member {
            user_id: 42,
            access_hash: Some(99),
            username: Some("someone".into()),
            first_name: Some("Some".into()),
            bot: false,
            deleted: false,
            scam: false,
            fake: false,
            last_seen,
        }
    }

    #[test]
    fn test_bots_and_deleted_accounts_are_rejected() {
        let now = Utc::now();
        let mut bot = member(LastSeen::Online);
        bot.bot = true;
        assert!(!member_invitable(&bot, LastSeenFilter::Off, now));

        let mut deleted = member(LastSeen::Online);
        deleted.deleted = true;
        assert!(!member_invitable(&deleted, LastSeenFilter::Off, now));
    }

    #[test]
    fn test_scam_flag_rejects_even_without_a_filter() {
        let mut m = member(LastSeen::Online);
        m.scam = true;
        assert!(!member_invitable(&m, LastSeenFilter::Off, Utc::now()));
    }

    #[test]
    fn test_hidden_status_passes_only_when_filter_is_off() {
        let now = Utc::now();
        let m = member(LastSeen::Hidden);
        assert!(member_invitable(&m, LastSeenFilter::Off, now));
        assert!(!member_invitable(&m, LastSeenFilter::Recent, now));
        assert!(!member_invitable(&m, LastSeenFilter::Month, now));
    }

    #[test]
    fn test_recent_filter_accepts_online_and_recently() {
        let now = Utc::now();
        assert!(member_invitable(
            &member(LastSeen::Online),
            LastSeenFilter::Recent,
            now
        ));
        assert!(member_invitable(
            &member(LastSeen::Recently),
            LastSeenFilter::Recent,
            now
        ));
        assert!(!member_invitable(
            &member(LastSeen::LastWeek),
            LastSeenFilter::Recent,
            now
        ));
    }

    #[test]
    fn test_exact_timestamps_are_measured_against_now() {
        let now = Utc::now();
        let fresh = member(LastSeen::At(now - TimeDelta::days(3)));
        let stale = member(LastSeen::At(now - TimeDelta::days(40)));
        assert!(member_invitable(&fresh, LastSeenFilter::Week, now));
        assert!(!member_invitable(&stale, LastSeenFilter::Month, now));
        assert!(member_invitable(&stale, LastSeenFilter::Off, now));
    }

    #[test]
    fn test_month_filter_accepts_the_last_month_bucket() {
        let now = Utc::now();
        assert!(member_invitable(
            &member(LastSeen::LastMonth),
            LastSeenFilter::Month,
            now
        ));
        assert!(!member_invitable(
            &member(LastSeen::LastMonth),
            LastSeenFilter::Week,
            now
        ));
    }
}
