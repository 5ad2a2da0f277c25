//! End-to-end tests that spawn real `sh` processes.

use std::time::Duration;

use docflow_core::{
    ArtifactFile, ExitStatus, FailureKind, GeneratedArtifact, Language, LimitKind,
};
use sandbox::{
    group_members, probe_isolation, proc_available, FilesystemPolicy, IsolationMode,
    NetworkPolicy, ProcessSandbox, SandboxError, SandboxLimits, SandboxRunner, SandboxSettings,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn sandbox(root: &TempDir) -> ProcessSandbox {
    ProcessSandbox::new(SandboxSettings::new(root.path())).unwrap()
}

fn shell(code: &str) -> GeneratedArtifact {
    GeneratedArtifact::new(code, Language::Shell)
}

/// Open limits, so these tests run on hosts that cannot build a jail.
fn limits() -> SandboxLimits {
    SandboxLimits::default()
        .with_wall_time(Duration::from_secs(10))
        .unconfined()
}

fn confined_limits() -> SandboxLimits {
    SandboxLimits::default().with_wall_time(Duration::from_secs(10))
}

fn scoped_dirs(root: &TempDir) -> usize {
    std::fs::read_dir(root.path())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with("docflow-run-"))
        .count()
}

#[tokio::test]
async fn test_successful_run_collects_outputs() {
    let root = TempDir::new().unwrap();
    let artifact = shell("cat arranged_data.json > report.txt\necho done")
        .with_input(ArtifactFile::new("arranged_data.json", "{\"revenue\": 1}"))
        .with_expected_output("report.txt")
        .with_expected_output("chart.png");

    let result = sandbox(&root)
        .run(&artifact, &limits(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.exit_status, ExitStatus::Code(0));
    assert_eq!(result.stdout, "done\n");
    assert!(!result.limit_exceeded);
    let report = result.file("report.txt").unwrap();
    assert_eq!(report.content.as_deref(), Some(&b"{\"revenue\": 1}"[..]));
    // Staged inputs and the script are not reported as produced.
    assert!(result.file("arranged_data.json").is_none());
    assert!(result.file("main.sh").is_none());
    assert_eq!(result.missing_outputs, vec!["chart.png".to_string()]);
    assert_eq!(scoped_dirs(&root), 0);
}

#[tokio::test]
async fn test_non_zero_exit_is_not_a_violation() {
    let root = TempDir::new().unwrap();
    let result = sandbox(&root)
        .run(&shell("echo oops >&2; exit 3"), &limits(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.exit_status, ExitStatus::Code(3));
    assert_eq!(result.stderr, "oops\n");
    assert!(!result.limit_exceeded);
    assert!(!result.succeeded());
}

#[tokio::test]
async fn test_wall_time_limit_kills_group() {
    let root = TempDir::new().unwrap();
    let limits = limits().with_wall_time(Duration::from_millis(500));
    let started = std::time::Instant::now();

    let result = sandbox(&root)
        .run(&shell("echo before\nsleep 30 &\nsleep 30"), &limits, CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.limit_exceeded);
    assert_eq!(result.limit, Some(LimitKind::WallTime));
    assert_eq!(result.stdout, "before\n");
    assert_eq!(scoped_dirs(&root), 0);
}

#[tokio::test]
async fn test_output_is_truncated_with_marker() {
    let root = TempDir::new().unwrap();
    let limits = limits().with_max_output(1000);

    let result = sandbox(&root)
        .run(
            &shell("i=0; while [ $i -lt 2000 ]; do echo line-$i; i=$((i+1)); done"),
            &limits,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.exit_status, ExitStatus::Code(0));
    assert!(result.stdout_truncated);
    assert!(!result.stderr_truncated);
    assert!(result.stdout.starts_with("line-0\n"));
    assert!(result.stdout.contains("[output truncated:"));
    assert!(result.stdout.len() < 1100);
}

#[tokio::test]
async fn test_memory_bomb_is_a_violation_with_partial_output() {
    if !proc_available() {
        return;
    }
    let root = TempDir::new().unwrap();
    let limits = limits().with_memory(64 * 1024 * 1024);

    let result = sandbox(&root)
        .run(
            &shell("echo started\nx=aaaaaaaaaaaaaaaa\nwhile :; do x=\"$x$x\"; done"),
            &limits,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.limit_exceeded);
    assert_eq!(result.limit, Some(LimitKind::Memory));
    assert_eq!(result.stdout, "started\n");
}

#[tokio::test]
async fn test_cpu_time_limit() {
    let root = TempDir::new().unwrap();
    let limits = limits().with_cpu_time(1);

    let result = sandbox(&root)
        .run(&shell("while :; do :; done"), &limits, CancellationToken::new())
        .await
        .unwrap();

    assert!(result.limit_exceeded);
    assert_eq!(result.limit, Some(LimitKind::CpuTime));
}

#[tokio::test]
async fn test_file_size_limit() {
    let root = TempDir::new().unwrap();
    let limits = limits().with_max_file(4096);

    let result = sandbox(&root)
        .run(
            &shell("head -c 100000 /dev/zero > big.bin\nexit $?"),
            &limits,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.limit_exceeded);
    assert_eq!(result.limit, Some(LimitKind::FileSize));
}

#[tokio::test]
async fn test_environment_is_cleared() {
    std::env::set_var("DOCFLOW_SANDBOX_TEST_SECRET", "hunter2");
    let root = TempDir::new().unwrap();

    let result = sandbox(&root)
        .run(&shell("env; pwd"), &limits(), CancellationToken::new())
        .await
        .unwrap();

    assert!(!result.stdout.contains("hunter2"));
    assert!(result.stdout.contains("HOME="));
    assert!(result.stdout.contains("docflow-run-"));
}

#[tokio::test]
async fn test_cancellation_leaves_no_process() {
    if !proc_available() {
        return;
    }
    let root = TempDir::new().unwrap();
    let marker = TempDir::new().unwrap();
    let pid_file = marker.path().join("pid");
    let code = format!(
        "echo $$ > {}\nsleep 60 &\nsleep 60",
        pid_file.display()
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = pid_file.clone();
    tokio::spawn(async move {
        while !watcher.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = sandbox(&root).run(&shell(&code), &limits(), cancel).await;
    assert!(matches!(result, Err(SandboxError::Cancelled)));

    let pgid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(group_members(pgid), 0);
    assert_eq!(scoped_dirs(&root), 0);
}

#[tokio::test]
async fn test_already_cancelled_never_spawns() {
    let root = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = sandbox(&root).run(&shell("echo hi"), &limits(), cancel).await;
    assert!(matches!(result, Err(SandboxError::Cancelled)));
}

#[tokio::test]
async fn test_network_egress_denied_or_refused() {
    let root = TempDir::new().unwrap();
    let sandbox = sandbox(&root);
    let bash = std::path::Path::new("/bin/bash").exists();
    let artifact = if bash {
        GeneratedArtifact::new(
            "exec 3<>/dev/tcp/1.1.1.1/80 && echo connected",
            Language::Bash,
        )
    } else {
        shell("wget -q -T 2 -O - http://1.1.1.1/ >/dev/null && echo connected")
    };
    let limits = confined_limits()
        .with_wall_time(Duration::from_secs(5))
        .with_network(NetworkPolicy::Deny)
        .with_filesystem(FilesystemPolicy::Host);

    let result = sandbox.run(&artifact, &limits, CancellationToken::new()).await;

    if sandbox.has_jail() {
        let result = result.unwrap();
        assert!(!result.stdout.contains("connected"));
        assert!(!result.exit_status.success());
    } else {
        let err = result.unwrap_err();
        assert!(matches!(err, SandboxError::IsolationUnavailable(_)));
        assert_eq!(err.kind(), Some(FailureKind::SandboxViolation));
        assert_eq!(scoped_dirs(&root), 0);
    }
}

#[tokio::test]
async fn test_host_files_and_parent_environment_hidden_or_refused() {
    std::env::set_var("DOCFLOW_API_KEY_SANDBOX_TEST", "sk-should-not-leak");
    let root = TempDir::new().unwrap();
    let host = TempDir::new().unwrap();
    let secret = host.path().join("credentials");
    std::fs::write(&secret, "host-only-secret").unwrap();

    let code = format!(
        "cat /proc/$PPID/environ 2>/dev/null\n\
         cat /proc/1/environ 2>/dev/null\n\
         if cat /etc/passwd >/dev/null 2>&1; then echo passwd-readable; fi\n\
         cat {secret} 2>/dev/null\n\
         if ls {home} >/dev/null 2>&1; then echo host-dir-listed; fi\n\
         echo checked",
        secret = secret.display(),
        home = host.path().display(),
    );
    let sandbox = sandbox(&root);
    let result = sandbox
        .run(&shell(&code), &confined_limits(), CancellationToken::new())
        .await;

    if sandbox.has_jail() {
        let result = result.unwrap();
        assert!(result.stdout.ends_with("checked\n"));
        assert!(!result.stdout.contains("sk-should-not-leak"));
        assert!(!result.stdout.contains("passwd-readable"));
        assert!(!result.stdout.contains("host-only-secret"));
        assert!(!result.stdout.contains("host-dir-listed"));
    } else {
        assert!(matches!(result, Err(SandboxError::IsolationUnavailable(_))));
    }
}

#[tokio::test]
async fn test_jailed_run_sees_only_its_workdir() {
    let root = TempDir::new().unwrap();
    let sandbox = sandbox(&root);
    if !sandbox.has_jail() {
        return;
    }
    let artifact = shell("cat arranged_data.json > report.txt\npwd\necho $HOME")
        .with_input(ArtifactFile::new("arranged_data.json", "{\"revenue\": 1}"))
        .with_expected_output("report.txt");

    let result = sandbox
        .run(&artifact, &confined_limits(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.exit_status, ExitStatus::Code(0));
    assert_eq!(result.stdout, "/work\n/work\n");
    let report = result.file("report.txt").unwrap();
    assert_eq!(report.content.as_deref(), Some(&b"{\"revenue\": 1}"[..]));
    assert!(result.missing_outputs.is_empty());
    assert_eq!(scoped_dirs(&root), 0);
}

#[tokio::test]
async fn test_required_isolation_matches_host_support() {
    let root = TempDir::new().unwrap();
    let available = probe_isolation(root.path());
    let settings = SandboxSettings::new(root.path()).with_isolation(IsolationMode::Required);

    match ProcessSandbox::new(settings) {
        Ok(sandbox) => {
            assert!(available);
            assert!(sandbox.has_jail());
        }
        Err(err) => {
            assert!(!available);
            assert!(matches!(err, SandboxError::IsolationUnavailable(_)));
        }
    }
}

#[tokio::test]
async fn test_large_outputs_returned_by_reference() {
    let root = TempDir::new().unwrap();
    let settings = SandboxSettings::new(root.path()).with_collect_cap(100);
    let sandbox = ProcessSandbox::new(settings).unwrap();

    let result = sandbox
        .run(
            &shell("head -c 1000 /dev/zero > blob.bin"),
            &limits(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let blob = result.file("blob.bin").unwrap();
    assert_eq!(blob.size_bytes, 1000);
    assert!(blob.content.is_none());
    assert!(std::path::Path::new(blob.reference.as_ref().unwrap()).exists());
}
