// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{reconcile, reconcile_with, Sandbox};

use anyhow::Result;
use fsconverge::{
    backup::BackupStore,
    config::{ClientConfig, DecisionMode},
    posix::Axis,
    report::{FinalState, Outcome, RunState},
};
use indoc::indoc;
use simple_test_case::test_case;
use std::{
    cell::Cell,
    fs,
    os::unix::fs::{symlink, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

const MOTD: &str = indoc! {r#"
    [[bundle]]
    name = "base"

    [[bundle.path]]
    name = "@ROOT@/x"
    type = "file"
    owner = "@UID@"
    group = "@GID@"
    perms = "0644"
    content = "hello\n"
"#};

fn mode(path: impl AsRef<Path>) -> Result<u32> {
    Ok(fs::symlink_metadata(path)?.mode() & 0o7777)
}

fn chmod(path: impl AsRef<Path>, mode: u32) -> Result<()> {
    Ok(fs::set_permissions(path, fs::Permissions::from_mode(mode))?)
}

#[test]
fn create_missing_file() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(MOTD)?;
    let config = ClientConfig::default();

    let report = reconcile(&config, &spec);
    let entry = report.entry(sandbox.path("x")).unwrap();
    pretty_assertions::assert_eq!(entry.outcome, Outcome::Converged);
    pretty_assertions::assert_eq!(entry.state, FinalState::Modified);
    pretty_assertions::assert_eq!(entry.axes, vec![Axis::Exists]);
    pretty_assertions::assert_eq!(fs::read_to_string(sandbox.path("x"))?, "hello\n");
    pretty_assertions::assert_eq!(mode(sandbox.path("x"))?, 0o644);
    pretty_assertions::assert_eq!(fs::metadata(sandbox.path("x"))?.uid(), nix::unistd::getuid().as_raw());
    pretty_assertions::assert_eq!(report.state, RunState::Clean);

    Ok(())
}

#[test]
fn fix_only_permissions() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(MOTD)?;
    fs::write(sandbox.path("x"), "hello\n")?;
    chmod(sandbox.path("x"), 0o600)?;
    let inode = fs::metadata(sandbox.path("x"))?.ino();

    let mut config = ClientConfig::default();
    config.dry_run = true;
    let report = reconcile(&config, &spec);
    let entry = report.entry(sandbox.path("x")).unwrap();
    pretty_assertions::assert_eq!(entry.axes, vec![Axis::Perms]);
    pretty_assertions::assert_eq!(entry.current.perms.as_deref(), Some("0600"));

    config.dry_run = false;
    let report = reconcile(&config, &spec);
    pretty_assertions::assert_eq!(report.entry(sandbox.path("x")).unwrap().outcome, Outcome::Converged);
    pretty_assertions::assert_eq!(mode(sandbox.path("x"))?, 0o644);
    pretty_assertions::assert_eq!(fs::read_to_string(sandbox.path("x"))?, "hello\n");
    pretty_assertions::assert_eq!(fs::metadata(sandbox.path("x"))?.ino(), inode);

    Ok(())
}

#[test]
fn prune_undeclared_children() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(indoc! {r#"
        [[bundle]]
        name = "base"

        [[bundle.path]]
        name = "@ROOT@/d"
        type = "directory"
        owner = "@UID@"
        group = "@GID@"
        perms = "0755"
        prune = true

        [[bundle.path]]
        name = "@ROOT@/d/sub/keepme"
        type = "file"
        owner = "@UID@"
        group = "@GID@"
        perms = "0644"
        content = "kept\n"
    "#})?;
    fs::create_dir_all(sandbox.path("d/sub"))?;
    chmod(sandbox.path("d"), 0o755)?;
    fs::write(sandbox.path("d/extra"), "stray\n")?;
    fs::write(sandbox.path("d/sub/keepme"), "kept\n")?;

    let mut config = ClientConfig::default();
    config.dry_run = true;
    let report = reconcile(&config, &spec);
    pretty_assertions::assert_eq!(report.extra, vec![sandbox.path("d/extra")]);
    pretty_assertions::assert_eq!(report.entry(sandbox.path("d")).unwrap().axes, vec![Axis::Prune]);

    config.dry_run = false;
    let report = reconcile(&config, &spec);
    pretty_assertions::assert_eq!(report.entry(sandbox.path("d")).unwrap().outcome, Outcome::Converged);
    pretty_assertions::assert_eq!(report.extra, Vec::<PathBuf>::new());
    assert!(!sandbox.path("d/extra").exists());
    assert!(sandbox.path("d/sub/keepme").exists());

    Ok(())
}

#[test]
fn retarget_symlink() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(indoc! {r#"
        [[bundle]]
        name = "base"

        [[bundle.path]]
        name = "@ROOT@/l"
        type = "symlink"
        owner = "@UID@"
        group = "@GID@"
        to = "@ROOT@/x"
    "#})?;
    symlink(sandbox.path("y"), sandbox.path("l"))?;

    let mut config = ClientConfig::default();
    config.dry_run = true;
    let report = reconcile(&config, &spec);
    pretty_assertions::assert_eq!(report.entry(sandbox.path("l")).unwrap().current.to, Some(sandbox.path("y")));

    config.dry_run = false;
    let report = reconcile(&config, &spec);
    pretty_assertions::assert_eq!(report.entry(sandbox.path("l")).unwrap().outcome, Outcome::Converged);
    pretty_assertions::assert_eq!(fs::read_link(sandbox.path("l"))?, sandbox.path("x"));

    Ok(())
}

#[test]
fn refuse_removing_managed_subtree() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(indoc! {r#"
        [[bundle]]
        name = "base"

        [[bundle.path]]
        name = "@ROOT@/d"
        type = "nonexistent"
        recursive = true

        [[bundle.path]]
        name = "@ROOT@/d/keepme"
        type = "file"
        owner = "@UID@"
        group = "@GID@"
        perms = "0644"
        content = "kept\n"
    "#})?;
    fs::create_dir(sandbox.path("d"))?;
    fs::write(sandbox.path("d/keepme"), "kept\n")?;
    chmod(sandbox.path("d/keepme"), 0o644)?;

    let report = reconcile(&ClientConfig::default(), &spec);
    let entry = report.entry(sandbox.path("d")).unwrap();
    pretty_assertions::assert_eq!(entry.outcome, Outcome::Failed);
    assert!(entry.explanation.as_deref().unwrap_or_default().contains("holds declared entries"));
    pretty_assertions::assert_eq!(report.entry(sandbox.path("d/keepme")).unwrap().outcome, Outcome::Clean);
    pretty_assertions::assert_eq!(fs::read_to_string(sandbox.path("d/keepme"))?, "kept\n");
    pretty_assertions::assert_eq!(report.state, RunState::Dirty);

    Ok(())
}

#[test]
fn second_run_changes_nothing() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(indoc! {r#"
        [[bundle]]
        name = "base"

        [[bundle.path]]
        name = "@ROOT@/etc/motd"
        type = "file"
        owner = "@UID@"
        group = "@GID@"
        perms = "0640"
        content = "welcome\n"
        mtime = 1000000

        [[bundle.path]]
        name = "@ROOT@/srv"
        type = "directory"
        owner = "@UID@"
        group = "@GID@"
        perms = "0750"

        [[bundle.path]]
        name = "@ROOT@/srv/motd"
        type = "hardlink"
        owner = "@UID@"
        group = "@GID@"
        to = "@ROOT@/etc/motd"

        [[bundle.path]]
        name = "@ROOT@/srv/fifo"
        type = "device"
        dev_type = "fifo"
        owner = "@UID@"
        group = "@GID@"
        perms = "0600"
    "#})?;
    let config = ClientConfig::default();

    let first = reconcile(&config, &spec);
    pretty_assertions::assert_eq!(first.modified, 4, "{first}");
    assert!(first.is_clean());

    let second = reconcile(&config, &spec);
    pretty_assertions::assert_eq!((second.good, second.modified, second.bad), (4, 0, 0));
    assert!(second.entries.iter().all(|entry| entry.outcome == Outcome::Clean));

    Ok(())
}

#[test]
fn binary_content_round_trip() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(indoc! {r#"
        [[bundle]]
        name = "base"

        [[bundle.path]]
        name = "@ROOT@/blob"
        type = "file"
        owner = "@UID@"
        group = "@GID@"
        perms = "0600"
        encoding = "base64"
        content = """
            AAEC
            /w==
        """
    "#})?;
    fs::write(sandbox.path("blob"), [9u8, 9, 9])?;

    let mut config = ClientConfig::default();
    config.dry_run = true;
    let report = reconcile(&config, &spec);
    let content = report.entry(sandbox.path("blob")).unwrap().content.clone();
    assert!(format!("{content:?}").contains("CQkJ"));

    config.dry_run = false;
    reconcile(&config, &spec);
    pretty_assertions::assert_eq!(fs::read(sandbox.path("blob"))?, vec![0u8, 1, 2, 255]);

    Ok(())
}

#[test]
fn backups_stay_bounded() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(MOTD)?;
    let mut config = ClientConfig::default();
    config.paranoid.enabled = true;
    config.paranoid.path = sandbox.path("backups");
    config.paranoid.max_copies = 2;

    for round in 0..4 {
        fs::write(sandbox.path("x"), format!("round {round}\n"))?;
        let report = reconcile(&config, &spec);
        assert!(report.is_clean());
    }

    let store = BackupStore::new(sandbox.path("backups"), 2);
    let backups = store.list(&sandbox.path("x"))?;
    pretty_assertions::assert_eq!(backups.len(), 2);
    pretty_assertions::assert_eq!(fs::read_to_string(&backups[1])?, "round 3\n");

    Ok(())
}

#[test]
fn sensitive_content_never_reported() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(indoc! {r#"
        [[bundle]]
        name = "base"

        [[bundle.path]]
        name = "@ROOT@/secret"
        type = "file"
        owner = "@UID@"
        group = "@GID@"
        perms = "0600"
        content = "hunter2\n"
        sensitive = true
    "#})?;
    fs::write(sandbox.path("secret"), "hunter1\n")?;

    let mut config = ClientConfig::default();
    config.dry_run = true;
    let report = reconcile(&config, &spec);
    let entry = report.entry(sandbox.path("secret")).unwrap();
    pretty_assertions::assert_eq!(entry.content, None);
    assert!(!report.to_string().contains("hunter"));

    Ok(())
}

#[test]
fn reinstall_clobbered_entry() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(indoc! {r#"
        [[bundle]]
        name = "base"

        [[bundle.path]]
        name = "@ROOT@/a"
        type = "file"
        owner = "@UID@"
        group = "@GID@"
        perms = "0644"
        content = "shared\n"

        [[bundle.path]]
        name = "@ROOT@/b"
        type = "permissions"
        owner = "@UID@"
        group = "@GID@"
        perms = "0600"
    "#})?;
    fs::write(sandbox.path("a"), "shared\n")?;
    chmod(sandbox.path("a"), 0o644)?;
    fs::hard_link(sandbox.path("a"), sandbox.path("b"))?;

    let report = reconcile(&ClientConfig::default(), &spec);
    pretty_assertions::assert_eq!(report.entry(sandbox.path("a")).unwrap().outcome, Outcome::Converged);
    pretty_assertions::assert_eq!(mode(sandbox.path("a"))?, 0o644);

    Ok(())
}

#[test]
fn bundle_filters_limit_installs() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(indoc! {r#"
        [[bundle]]
        name = "web"

        [[bundle.path]]
        name = "@ROOT@/web"
        type = "directory"
        owner = "@UID@"
        group = "@GID@"
        perms = "0755"

        [[bundle]]
        name = "db"

        [[bundle.path]]
        name = "@ROOT@/db"
        type = "directory"
        owner = "@UID@"
        group = "@GID@"
        perms = "0700"
    "#})?;
    let mut config = ClientConfig::default();
    config.bundles = vec!["web".into()];

    let report = reconcile(&config, &spec);
    pretty_assertions::assert_eq!(report.entry(sandbox.path("web")).unwrap().outcome, Outcome::Converged);
    pretty_assertions::assert_eq!(report.entry(sandbox.path("db")).unwrap().outcome, Outcome::Skipped);
    assert!(!sandbox.path("db").exists());

    Ok(())
}

#[test_case(DecisionMode::Whitelist, "file:*/x", Outcome::Converged; "whitelist match")]
#[test_case(DecisionMode::Whitelist, "file:*/y", Outcome::Skipped; "whitelist miss")]
#[test_case(DecisionMode::Blacklist, "file:*/x", Outcome::Skipped; "blacklist match")]
#[test_case(DecisionMode::Blacklist, "symlink:*", Outcome::Converged; "blacklist miss")]
#[test]
fn decision_lists(mode: DecisionMode, pattern: &str, expect: Outcome) -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(MOTD)?;
    let mut config = ClientConfig::default();
    config.decision.mode = mode;
    config.decision.list = vec![pattern.into()];

    let report = reconcile(&config, &spec);
    pretty_assertions::assert_eq!(report.entry(sandbox.path("x")).unwrap().outcome, expect);

    Ok(())
}

#[test]
fn interactive_asks_once_per_entry() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(MOTD)?;
    let mut config = ClientConfig::default();
    config.interactive = true;
    let asked = Cell::new(0);

    let report = reconcile_with(&config, &spec, |prompt: &str| {
        asked.set(asked.get() + 1);
        prompt.contains("Install file")
    });
    pretty_assertions::assert_eq!(asked.get(), 1);
    pretty_assertions::assert_eq!(report.entry(sandbox.path("x")).unwrap().outcome, Outcome::Converged);

    Ok(())
}

#[test]
fn broken_entries_do_not_stop_run() -> Result<()> {
    let sandbox = Sandbox::new()?;
    let spec = sandbox.spec(indoc! {r#"
        [[bundle]]
        name = "base"

        [[bundle.path]]
        name = "@ROOT@/unbound"
        type = "file"
        failure = "no generator matched"

        [[bundle.path]]
        name = "@ROOT@/partial"
        type = "directory"
        owner = "@UID@"

        [[bundle.path]]
        name = "@ROOT@/x"
        type = "file"
        owner = "@UID@"
        group = "@GID@"
        perms = "0644"
        content = "hello\n"

        [[bundle.path]]
        name = "@ROOT@/x"
        type = "nonexistent"
    "#})?;

    let report = reconcile(&ClientConfig::default(), &spec);
    let outcomes: Vec<Outcome> = report.entries.iter().map(|entry| entry.outcome).collect();
    pretty_assertions::assert_eq!(
        outcomes,
        vec![
            Outcome::BindFailure,
            Outcome::Incomplete,
            Outcome::Converged,
            Outcome::Incomplete,
        ]
    );
    pretty_assertions::assert_eq!(report.entries[0].explanation.as_deref(), Some("no generator matched"));
    assert!(sandbox.path("x").exists());
    pretty_assertions::assert_eq!((report.total, report.good, report.bad), (4, 1, 3));

    Ok(())
}
