// End-to-end run: scripted fake agent, real git repository, echo validation
#![cfg(unix)]

use std::fs;
use std::path::Path;

use foreman::acp::ProtocolClientConfig;
use foreman::models::{ExecutionPlan, ParallelGroup, Phase, PlanItem};
use foreman::orchestrator::{Engine, EngineConfig, RunOutcome};
use foreman::state::StateStore;
use foreman::validation::ValidationConfig;
use tempfile::TempDir;
use tokio::process::Command;

async fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

async fn setup_repo(dir: &Path) {
    git(dir, &["init", "-b", "main"]).await;
    git(dir, &["config", "user.name", "Test User"]).await;
    git(dir, &["config", "user.email", "test@example.com"]).await;
    fs::write(dir.join("README.md"), "# project\n").unwrap();
    git(dir, &["add", "."]).await;
    git(dir, &["commit", "-m", "Initial commit"]).await;
}

// Speaks just enough of the protocol: answers the handshake, extracts its
// branch from the prompt, commits one file to it, and ends the turn.
fn write_fake_agent(dir: &Path) -> String {
    use std::os::unix::fs::PermissionsExt;
    let script = r#"#!/bin/sh
read -r _init
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":1}}\n'
read -r _newsess
printf '{"jsonrpc":"2.0","id":2,"result":{"sessionId":"s1"}}\n'
read -r prompt
branch=$(printf '%s' "$prompt" | sed "s|.*'\(agent/[a-z0-9-]*\)'.*|\1|")
printf '{"jsonrpc":"2.0","method":"session/update","params":{"progress":50,"activity":"editing"}}\n'
git checkout -q "$branch"
name=$(basename "$branch")
echo "work for $branch" > "$name.txt"
git add .
git commit -q -m "Implement $name"
git checkout -q main
printf '{"jsonrpc":"2.0","id":3,"result":{"stopReason":"end_turn"}}\n'
read -r _wait
"#;
    let path = dir.join("fake-agent.sh");
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().to_string()
}

fn two_item_plan() -> ExecutionPlan {
    ExecutionPlan {
        id: "e2e-plan".to_string(),
        name: "End to end".to_string(),
        phases: vec![Phase {
            number: 1,
            groups: vec![ParallelGroup {
                tag: "core".to_string(),
                items: vec![
                    PlanItem {
                        id: "t1".to_string(),
                        title: "First item".to_string(),
                        description: "Create t1.txt".to_string(),
                        dependencies: vec![],
                    },
                    PlanItem {
                        id: "t2".to_string(),
                        title: "Second item".to_string(),
                        description: "Create t2.txt".to_string(),
                        dependencies: vec!["t1".to_string()],
                    },
                ],
            }],
        }],
    }
}

#[tokio::test]
async fn full_run_merges_validates_and_archives() {
    let repo = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    setup_repo(repo.path()).await;
    let agent = write_fake_agent(home.path());

    let store = StateStore::new(home.path().join("state.json"));
    let config = EngineConfig {
        repo_path: repo.path().to_path_buf(),
        target_branch: "main".to_string(),
        max_agents: 2,
        max_attempts: 2,
        agent: ProtocolClientConfig {
            binary: agent,
            request_timeout_ms: 10_000,
            shutdown_grace_ms: 1_000,
            ..Default::default()
        },
        validation: ValidationConfig {
            build_commands: vec!["true".to_string()],
            test_commands: vec!["echo 'Tests  1 passed | 1 total'".to_string()],
            smoke: None,
            command_timeout_ms: 10_000,
        },
    };

    let engine = Engine::new(config, StateStore::new(home.path().join("state.json")));
    let plan = two_item_plan();
    let outcome = engine.run(&plan, false).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    // Both branches merged into main, dependency order respected by t2
    // building on t1's merged work.
    assert!(repo.path().join("t1.txt").exists());
    assert!(repo.path().join("t2.txt").exists());

    // Merged branches are deleted.
    let branches = Command::new("git")
        .args(["branch", "--list", "agent/*"])
        .current_dir(repo.path())
        .output()
        .await
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&branches.stdout).trim(), "");

    // Run archived, no active state left behind.
    assert!(store.active_state().unwrap().is_none());
    let recent = store.recent_runs().unwrap();
    assert_eq!(recent.len(), 1);
    let archived = &recent[0].state;
    assert_eq!(archived.plan_id, "e2e-plan");
    assert_eq!(archived.progress, 100);
    assert_eq!(archived.completed.len(), 2);
    assert!(archived.failed.is_empty());

    // Validation reports persisted next to the state file.
    let report_dir = home.path().join("reports").join("e2e-plan");
    assert!(report_dir.join("t1.md").exists());
    assert!(report_dir.join("t2.md").exists());
}

#[tokio::test]
async fn dirty_tree_fails_one_item_and_run_continues() {
    use std::os::unix::fs::PermissionsExt;

    let repo = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    setup_repo(repo.path()).await;

    // The t1 agent litters the working tree with an untracked file, so its
    // merge is refused. The t2 agent cleans it up and does real work.
    let script = r#"#!/bin/sh
read -r _init
printf '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":1}}\n'
read -r _newsess
printf '{"jsonrpc":"2.0","id":2,"result":{"sessionId":"s1"}}\n'
read -r prompt
branch=$(printf '%s' "$prompt" | sed "s|.*'\(agent/[a-z0-9-]*\)'.*|\1|")
case "$branch" in
*/t1)
    echo "scratch" > junk.txt
    ;;
*/t2)
    rm -f junk.txt
    git checkout -q "$branch"
    echo "work" > t2.txt
    git add .
    git commit -q -m "Implement t2"
    git checkout -q main
    ;;
esac
printf '{"jsonrpc":"2.0","id":3,"result":{"stopReason":"end_turn"}}\n'
read -r _wait
"#;
    let agent = home.path().join("fake-agent.sh");
    fs::write(&agent, script).unwrap();
    let mut perms = fs::metadata(&agent).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&agent, perms).unwrap();

    let store = StateStore::new(home.path().join("state.json"));
    let config = EngineConfig {
        repo_path: repo.path().to_path_buf(),
        target_branch: "main".to_string(),
        max_agents: 1,
        max_attempts: 1,
        agent: ProtocolClientConfig {
            binary: agent.to_string_lossy().to_string(),
            request_timeout_ms: 10_000,
            shutdown_grace_ms: 1_000,
            ..Default::default()
        },
        validation: ValidationConfig {
            build_commands: vec!["true".to_string()],
            test_commands: vec![],
            smoke: None,
            command_timeout_ms: 10_000,
        },
    };

    let engine = Engine::new(config, StateStore::new(home.path().join("state.json")));
    let mut plan = two_item_plan();
    // Independent items: t2 must still run after t1's failure.
    plan.phases[0].groups[0].items[1].dependencies.clear();
    let outcome = engine.run(&plan, false).await.unwrap();

    assert_eq!(outcome, RunOutcome::CompletedWithFailures);
    assert!(repo.path().join("t2.txt").exists());

    let recent = store.recent_runs().unwrap();
    let archived = &recent[0].state;
    assert!(archived.failed.contains(&"t1".to_string()));
    assert_eq!(archived.completed.len(), 1);
    assert_eq!(archived.completed[0].id, "t2");
}

#[tokio::test]
async fn unwritable_report_dir_does_not_stop_the_run() {
    let repo = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    setup_repo(repo.path()).await;
    let agent = write_fake_agent(home.path());

    // A plain file squatting on the reports path makes every report write
    // fail; the run must still finish on in-memory state.
    fs::write(home.path().join("reports"), "in the way").unwrap();

    let store = StateStore::new(home.path().join("state.json"));
    let config = EngineConfig {
        repo_path: repo.path().to_path_buf(),
        target_branch: "main".to_string(),
        max_agents: 2,
        max_attempts: 2,
        agent: ProtocolClientConfig {
            binary: agent,
            request_timeout_ms: 10_000,
            shutdown_grace_ms: 1_000,
            ..Default::default()
        },
        validation: ValidationConfig {
            build_commands: vec!["true".to_string()],
            test_commands: vec![],
            smoke: None,
            command_timeout_ms: 10_000,
        },
    };

    let engine = Engine::new(config, StateStore::new(home.path().join("state.json")));
    let outcome = engine.run(&two_item_plan(), false).await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert!(repo.path().join("t1.txt").exists());
    assert!(repo.path().join("t2.txt").exists());
    assert!(store.active_state().unwrap().is_none());
    let recent = store.recent_runs().unwrap();
    assert_eq!(recent[0].state.completed.len(), 2);
}

#[tokio::test]
async fn failing_agent_exhausts_retries_and_cascades() {
    use std::os::unix::fs::PermissionsExt;

    let repo = TempDir::new().unwrap();
    let home = TempDir::new().unwrap();
    setup_repo(repo.path()).await;

    // An agent that always dies mid-handshake.
    let script = "#!/bin/sh\nread -r _init\nexit 7\n";
    let agent = home.path().join("broken-agent.sh");
    fs::write(&agent, script).unwrap();
    let mut perms = fs::metadata(&agent).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&agent, perms).unwrap();

    let store = StateStore::new(home.path().join("state.json"));
    let config = EngineConfig {
        repo_path: repo.path().to_path_buf(),
        target_branch: "main".to_string(),
        max_agents: 1,
        max_attempts: 2,
        agent: ProtocolClientConfig {
            binary: agent.to_string_lossy().to_string(),
            request_timeout_ms: 5_000,
            shutdown_grace_ms: 500,
            ..Default::default()
        },
        validation: ValidationConfig::default(),
    };

    let engine = Engine::new(config, StateStore::new(home.path().join("state.json")));
    let outcome = engine.run(&two_item_plan(), false).await.unwrap();
    assert_eq!(outcome, RunOutcome::CompletedWithFailures);

    // t1 failed after its attempts; t2 cascaded without ever running.
    let recent = store.recent_runs().unwrap();
    let archived = &recent[0].state;
    assert!(archived.completed.is_empty());
    assert!(archived.failed.contains(&"t1".to_string()));
}
