//! Interactive setup flows shared by all front ends.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::config::{INVITE_LIMIT_MAX, Settings, SettingsError};
use crate::store::{Group, GroupRole, Ledger, LedgerError};
use crate::telegram::{AccountSession, ProviderError};

use super::link::{FrontendLink, GroupOption};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Offers the session's invitable groups and stores the chosen one as
/// the target. Returns `None` when there is nothing to offer or the
/// operator skips.
///
/// Only public supergroups qualify, since every worker account must be
/// able to join the target by link on its own.
///
/// # Errors
///
/// Fails when the dialog listing or the ledger write fails.
pub async fn choose_target_group(
    link: &FrontendLink,
    session: &dyn AccountSession,
    ledger: &dyn Ledger,
) -> Result<Option<Group>, SetupError> {
    let dialogs = session.list_dialogs().await?;
    let mut candidates = HashMap::new();
    let mut options = Vec::new();
    for dialog in dialogs {
        let Some(url) = dialog.invitable_by_link() else {
            continue;
        };
        options.push(GroupOption {
            chat_id: dialog.chat_id,
            title: dialog.title.clone(),
            member_count: dialog.member_count,
        });
        candidates.insert(dialog.chat_id, (url, dialog.title));
    }
    if options.is_empty() {
        info!("no public groups available to use as a target");
        return Ok(None);
    }

    let Some(chat_id) = link.select_group(options).await else {
        return Ok(None);
    };
    let Some((url, title)) = candidates.remove(&chat_id) else {
        return Ok(None);
    };

    // The link may already be known; reuse the row instead of tripping
    // the unique constraint.
    let existing = ledger
        .list_groups()
        .await?
        .into_iter()
        .find(|group| group.link == url);
    let group = match existing {
        Some(group) => {
            ledger.update_group_name(group.id, &title).await?;
            ledger.set_target_group(group.id).await?;
            Group {
                name: Some(title),
                role: GroupRole::Target,
                ..group
            }
        }
        None => ledger.add_group(&url, Some(&title), GroupRole::Target).await?,
    };
    info!(target = %group.display_name(), link = %group.link, "invite target updated");
    Ok(Some(group))
}

/// Asks for a new per-account invite ceiling and persists it. Returns
/// `false` when the operator skips.
///
/// # Errors
///
/// Fails when the settings file cannot be written.
pub async fn adjust_invite_limit(
    link: &FrontendLink,
    settings: &mut Settings,
    path: impl AsRef<Path>,
) -> Result<bool, SettingsError> {
    let Some(limit) = link
        .request_limit(settings.invite_limit, INVITE_LIMIT_MAX)
        .await
    else {
        return Ok(false);
    };
    settings.set_invite_limit(limit);
    settings.save(path.as_ref())?;
    info!(limit = settings.invite_limit, "invite limit updated");
    Ok(true)
}
