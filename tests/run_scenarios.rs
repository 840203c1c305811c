//! End-to-end invite runs against the in-memory ledger and a scripted
//! Telegram fake. Each test builds a small world, runs the orchestrator
//! to completion and checks what the accounts actually did.

use std::sync::Arc;

use tokio::sync::watch;

use invite_scraper_bot::config::Settings;
use invite_scraper_bot::frontend::{self, Prompt, RunEvent, RunInput};
use invite_scraper_bot::scheduler::{GroupRunStatus, Orchestrator, RunStatus, StatusReport};
use invite_scraper_bot::store::{GroupRole, Ledger};
use invite_scraper_bot::telegram::{GroupAccess, InviteRefusal, ProviderError};
use invite_scraper_bot::testing::{
    FakeTelegram, MemoryLedger, bot_member, fast_settings, member, members, new_account,
};

const TARGET_LINK: &str = "https://t.me/target";
const SOURCE_LINK: &str = "https://t.me/spring";

/// Zero-pacing settings with a deterministic quota and one worker.
fn serial_settings(invite_limit: u32) -> Settings {
    Settings {
        invite_limit,
        invite_limit_spread: 0,
        max_workers: 1,
        ..fast_settings()
    }
}

async fn seed_ledger(ledger: &MemoryLedger, accounts: u32) {
    for n in 1..=accounts {
        ledger.add_account(new_account(n)).await.unwrap();
    }
    ledger
        .add_group(TARGET_LINK, Some("Target"), GroupRole::Target)
        .await
        .unwrap();
}

async fn add_source(ledger: &MemoryLedger, link: &str) {
    ledger
        .add_group(link, None, GroupRole::Source)
        .await
        .unwrap();
}

/// Runs with no front end attached; prompts read as skip.
async fn run_unattended(
    ledger: &Arc<MemoryLedger>,
    telegram: &FakeTelegram,
    settings: Settings,
) -> StatusReport {
    let orchestrator = Orchestrator::new(
        Arc::clone(ledger),
        Arc::new(telegram.clone()),
        settings,
    );
    let (core, front) = frontend::link();
    drop(front);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    orchestrator.run(Arc::new(core), cancel_rx).await.unwrap()
}

fn ids_for_phone(telegram: &FakeTelegram, phone: &str) -> Vec<i64> {
    telegram
        .invited()
        .into_iter()
        .filter(|(p, _)| p == phone)
        .map(|(_, id)| id)
        .collect()
}

#[tokio::test]
async fn completes_and_invites_every_eligible_member() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 1).await;
    add_source(&ledger, SOURCE_LINK).await;

    let mut source_members = members(1, 5);
    source_members.push(bot_member(6));
    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", vec![member(50)])
        .with_group(SOURCE_LINK, 200, "Spring", source_members);

    let report = run_unattended(&ledger, &telegram, serial_settings(10)).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.users_added, 5);
    assert_eq!(telegram.invited_user_ids(), vec![1, 2, 3, 4, 5]);

    // One target join by the seeding account, reused by the worker.
    assert_eq!(telegram.join_count(TARGET_LINK), 1);
    assert_eq!(telegram.join_count(SOURCE_LINK), 1);
    assert_eq!(telegram.persisted_sessions(), vec!["+15550000001".to_owned()]);

    let account = ledger.get_account(1).await.unwrap().unwrap();
    assert_eq!(account.invites_remaining, 5);
    assert_eq!(account.session_blob.as_deref(), Some("session-+15550000001"));

    let source = ledger.list_groups().await.unwrap().pop().unwrap();
    assert_eq!(source.member_count, 6);

    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.groups[0].status, GroupRunStatus::Exhausted);
    assert_eq!(report.groups[0].users_added, 5);
}

#[tokio::test]
async fn existing_target_members_are_never_reinvited() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 1).await;
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", vec![member(1), member(2)])
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 4));

    let report = run_unattended(&ledger, &telegram, serial_settings(10)).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(telegram.invited_user_ids(), vec![3, 4]);
    // Known members are skipped before any request goes out.
    assert_eq!(telegram.invite_attempts(), 2);
    assert_eq!(report.users_added, 2);
    assert_eq!(report.users_processed, 2);
}

#[tokio::test]
async fn second_run_invites_nobody_new() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 1).await;
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 5));

    let first = run_unattended(&ledger, &telegram, serial_settings(10)).await;
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.users_added, 5);

    // Invited users are target members now, so the reseeded run skips them.
    let second = run_unattended(&ledger, &telegram, serial_settings(10)).await;
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.users_added, 0);
    assert_eq!(second.users_processed, 0);
    assert_eq!(telegram.invite_attempts(), 5);
}

#[tokio::test]
async fn quota_exhaustion_rotates_to_the_next_account() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 3).await;
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 10));

    let report = run_unattended(&ledger, &telegram, serial_settings(2)).await;

    // Three accounts with two invites each cover six of the ten members;
    // the rest stay untouched for the next run.
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.users_added, 6);
    assert_eq!(report.users_processed, 6);
    assert_eq!(report.accounts_used, 3);
    assert_eq!(ids_for_phone(&telegram, "+15550000001"), vec![1, 2]);
    assert_eq!(ids_for_phone(&telegram, "+15550000002"), vec![3, 4]);
    assert_eq!(ids_for_phone(&telegram, "+15550000003"), vec![5, 6]);
    // Each rotation joins the group again when it comes off the queue.
    assert_eq!(telegram.join_count(SOURCE_LINK), 3);

    for id in [1, 2, 3] {
        let account = ledger.get_account(id).await.unwrap().unwrap();
        assert_eq!(account.invites_remaining, 0, "account {id}");
        assert!(account.quota_reset_at.is_some(), "account {id}");
    }
    // Nobody finished the pass, the group is still waiting for quota.
    assert_eq!(report.groups[0].status, GroupRunStatus::Waiting);
}

#[tokio::test]
async fn banned_account_is_marked_and_the_rest_continue() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 2).await;
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 4))
        .with_invites_failing_after("+15550000001", 2, ProviderError::PhoneBanned);

    let report = run_unattended(&ledger, &telegram, serial_settings(10)).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.users_added, 4);
    assert_eq!(ids_for_phone(&telegram, "+15550000001"), vec![1, 2]);
    // The failed invite left no record, so the next account retried it.
    assert_eq!(ids_for_phone(&telegram, "+15550000002"), vec![3, 4]);

    let banned = ledger.get_account(1).await.unwrap().unwrap();
    assert!(banned.deactivated);
    assert!(banned.details.is_some());
    let healthy = ledger.get_account(2).await.unwrap().unwrap();
    assert!(!healthy.deactivated);
}

#[tokio::test]
async fn account_banned_at_login_never_counts_as_used() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 2).await;
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 3))
        .with_connect_error("+15550000001", ProviderError::PhoneBanned);

    let report = run_unattended(&ledger, &telegram, serial_settings(10)).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.users_added, 3);
    // The banned account never activated, so it did no work.
    assert_eq!(report.accounts_used, 1);
    assert!(ids_for_phone(&telegram, "+15550000001").is_empty());
    assert_eq!(ids_for_phone(&telegram, "+15550000002"), vec![1, 2, 3]);

    let banned = ledger.get_account(1).await.unwrap().unwrap();
    assert!(banned.deactivated);
    assert!(banned.details.is_some());
}

#[tokio::test]
async fn refused_member_is_recorded_for_every_account() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 2).await;
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 4))
        .with_invite_error(
            2,
            ProviderError::UserNotInvitable(InviteRefusal::PrivacyRestricted),
        );

    let report = run_unattended(&ledger, &telegram, serial_settings(2)).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(telegram.invited_user_ids(), vec![1, 3, 4]);
    // The refusal burned no quota and was not retried by the second
    // account: one attempt each for users 1, 2, 3 and 4.
    assert_eq!(telegram.invite_attempts(), 4);
    assert_eq!(report.users_added, 3);
    assert_eq!(report.users_processed, 4);
    assert_eq!(report.groups[0].users_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn flood_wait_pauses_then_retries_the_same_member() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 1).await;
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 3))
        .with_invite_error(2, ProviderError::FloodWait(30));

    let report = run_unattended(&ledger, &telegram, serial_settings(10)).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(telegram.invited_user_ids(), vec![1, 2, 3]);
    assert_eq!(telegram.invite_attempts(), 4);
    assert_eq!(report.users_added, 3);
}

#[tokio::test]
async fn inaccessible_source_is_disabled_after_two_accounts() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 2).await;
    add_source(&ledger, SOURCE_LINK).await;

    let inaccessible = ProviderError::GroupInaccessible(GroupAccess::Private);
    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 3))
        .with_join_error(SOURCE_LINK, inaccessible.clone())
        .with_join_error(SOURCE_LINK, inaccessible.clone())
        .with_join_error(SOURCE_LINK, inaccessible);

    let report = run_unattended(&ledger, &telegram, serial_settings(10)).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert!(telegram.invited_user_ids().is_empty());
    assert_eq!(report.groups[0].status, GroupRunStatus::Disabled);

    let source = ledger.list_groups().await.unwrap().pop().unwrap();
    assert!(!source.enabled);
    assert!(source.details.is_some());
}

#[tokio::test]
async fn invalid_source_link_is_disabled_on_first_failure() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 1).await;
    add_source(&ledger, "https://t.me/ghost").await;
    add_source(&ledger, SOURCE_LINK).await;

    // The ghost link does not resolve at all; the other source works.
    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 4));

    let report = run_unattended(&ledger, &telegram, serial_settings(10)).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(telegram.invited_user_ids(), vec![1, 2, 3, 4]);

    let groups = ledger.list_groups().await.unwrap();
    let ghost = groups.iter().find(|g| g.link.ends_with("ghost")).unwrap();
    assert!(!ghost.enabled);
    let spring = groups.iter().find(|g| g.link == SOURCE_LINK).unwrap();
    assert!(spring.enabled);
}

#[tokio::test]
async fn invalid_target_link_aborts_the_run() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 1).await;
    add_source(&ledger, SOURCE_LINK).await;

    // The target link resolves for nobody.
    let telegram =
        FakeTelegram::new().with_group(SOURCE_LINK, 200, "Spring", members(1, 4));

    let report = run_unattended(&ledger, &telegram, serial_settings(10)).await;

    assert_eq!(report.status, RunStatus::Aborted);
    let reason = report.abort_reason.unwrap();
    assert!(reason.contains("invalid"), "unexpected reason: {reason}");
    assert!(telegram.invited_user_ids().is_empty());
}

#[tokio::test]
async fn aborts_without_eligible_accounts() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger
        .add_group(TARGET_LINK, Some("Target"), GroupRole::Target)
        .await
        .unwrap();
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new();
    let report = run_unattended(&ledger, &telegram, serial_settings(10)).await;

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.abort_reason.as_deref(), Some("no eligible accounts"));
    assert_eq!(report.users_added, 0);
}

#[tokio::test]
async fn aborts_without_a_target_group() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger.add_account(new_account(1)).await.unwrap();
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new();
    let report = run_unattended(&ledger, &telegram, serial_settings(10)).await;

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(
        report.abort_reason.as_deref(),
        Some("no target group configured")
    );
}

#[tokio::test]
async fn login_code_flow_signs_the_account_in() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 1).await;
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 3))
        .with_unauthorized("+15550000001");

    let orchestrator = Orchestrator::new(
        Arc::clone(&ledger),
        Arc::new(telegram.clone()),
        serial_settings(10),
    );
    let (core, mut front) = frontend::link();
    let pump = tokio::spawn(async move {
        while let Some(event) = front.next_event().await {
            if let RunEvent::Prompt {
                prompt: Prompt::LoginCode { .. },
            } = event
            {
                assert!(front.send(RunInput::Code("11111".into())).await);
            }
        }
    });
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = orchestrator.run(Arc::new(core), cancel_rx).await.unwrap();
    pump.await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(telegram.invited_user_ids(), vec![1, 2, 3]);
    let account = ledger.get_account(1).await.unwrap().unwrap();
    assert!(account.authenticated);
}

#[tokio::test]
async fn skipped_login_consumes_the_account_and_the_rest_continue() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 2).await;
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 3))
        .with_unauthorized("+15550000001");

    let orchestrator = Orchestrator::new(
        Arc::clone(&ledger),
        Arc::new(telegram.clone()),
        serial_settings(10),
    );
    let (core, mut front) = frontend::link();
    let pump = tokio::spawn(async move {
        while let Some(event) = front.next_event().await {
            if let RunEvent::Prompt { .. } = event {
                assert!(front.send(RunInput::Skip).await);
            }
        }
    });
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let report = orchestrator.run(Arc::new(core), cancel_rx).await.unwrap();
    pump.await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(ids_for_phone(&telegram, "+15550000001").is_empty());
    assert_eq!(ids_for_phone(&telegram, "+15550000002"), vec![1, 2, 3]);
    // Skipping a login is a per-run decision, not a ledger flag.
    let skipped = ledger.get_account(1).await.unwrap().unwrap();
    assert!(skipped.authenticated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_workers_never_invite_a_user_twice() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 4).await;
    add_source(&ledger, SOURCE_LINK).await;
    add_source(&ledger, "https://t.me/autumn").await;

    // The sources overlap on users 11..=30.
    let telegram = FakeTelegram::new()
        .with_page_size(10)
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 30))
        .with_group("https://t.me/autumn", 300, "Autumn", members(11, 40));

    let settings = Settings {
        invite_limit: 50,
        invite_limit_spread: 0,
        max_workers: 4,
        ..fast_settings()
    };
    let report = run_unattended(&ledger, &telegram, settings).await;

    assert_eq!(report.status, RunStatus::Completed);
    let mut invited = telegram.invited_user_ids();
    invited.sort_unstable();
    assert_eq!(invited, (1..=40).collect::<Vec<i64>>());
    assert_eq!(report.users_added, 40);
    assert_eq!(report.users_processed, 40);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_run_and_preserves_quota() {
    let ledger = Arc::new(MemoryLedger::new());
    seed_ledger(&ledger, 1).await;
    add_source(&ledger, SOURCE_LINK).await;

    let telegram = FakeTelegram::new()
        .with_group(TARGET_LINK, 100, "Target", Vec::new())
        .with_group(SOURCE_LINK, 200, "Spring", members(1, 200));

    let settings = Settings {
        invite_limit: 50,
        invite_limit_spread: 0,
        max_workers: 1,
        invite_pause_secs: 1,
        ..fast_settings()
    };
    let orchestrator = Orchestrator::new(
        Arc::clone(&ledger),
        Arc::new(telegram.clone()),
        settings,
    );
    let (core, mut front) = frontend::link();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let pump = tokio::spawn(async move {
        while let Some(event) = front.next_event().await {
            if let RunEvent::Status { .. } = event {
                let _ = cancel_tx.send(true);
            }
        }
    });
    let report = orchestrator.run(Arc::new(core), cancel_rx).await.unwrap();
    pump.await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    let invited = telegram.invited_user_ids().len();
    assert!(invited < 50, "cancel came too late: {invited} invites");
    assert_eq!(report.users_added, invited);

    // Every successful invite was durably charged, nothing else.
    let account = ledger.get_account(1).await.unwrap().unwrap();
    assert_eq!(account.invites_remaining, 50 - i64::try_from(invited).unwrap());
}
