//! End-to-end runs through the coordinator and the native sandbox. Each test
//! skips itself when the toolchain it needs is not installed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::WORKSPACE_PREFIX;
use crate::core::domain::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, LimitKind, PartialLimits, SessionId,
};
use crate::core::errors::ExecuteError;
use crate::core::pipeline::coordinator::Coordinator;
use crate::core::registry::LanguageRegistry;
use crate::native::sandbox::NativeSandbox;
use crate::test_utils::{
    assert_empty_dir, confinement_available, processes_with_token, test_config, tool_available,
};

fn engine(root: &Path) -> Arc<Coordinator> {
    let config = test_config(root);
    let sandbox = Arc::new(NativeSandbox::from_config(&config));
    Arc::new(Coordinator::new(config, LanguageRegistry::builtin(), sandbox))
}

async fn execute(
    coordinator: &Coordinator,
    request: ExecutionRequest,
) -> Result<ExecutionResult, ExecuteError> {
    coordinator.submit(&SessionId::random(), request).await
}

async fn assert_hello(language: &str, tools: &[&str], source: &str) {
    if !tools.iter().all(|tool| tool_available(tool)) {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let coordinator = engine(root.path());

    let result = execute(&coordinator, ExecutionRequest::new(language, source))
        .await
        .unwrap();

    assert_eq!(
        result.status(),
        ExecutionStatus::Success,
        "{language}: {:?}",
        result
    );
    assert_eq!(result.exit_code(), Some(0));
    assert_eq!(result.stdout().trim(), "Hello, World!");
    assert_empty_dir(root.path());
}

#[tokio::test]
async fn test_hello_world_python() {
    assert_hello("python", &["python3"], "print('Hello, World!')\n").await;
}

#[tokio::test]
async fn test_hello_world_bash() {
    assert_hello("bash", &["bash"], "echo 'Hello, World!'\n").await;
}

#[tokio::test]
async fn test_hello_world_javascript() {
    assert_hello("javascript", &["node"], "console.log('Hello, World!');\n").await;
}

#[tokio::test]
async fn test_hello_world_c() {
    assert_hello(
        "c",
        &["gcc"],
        "#include <stdio.h>\nint main(void) { puts(\"Hello, World!\"); return 0; }\n",
    )
    .await;
}

#[tokio::test]
async fn test_hello_world_cpp() {
    assert_hello(
        "cpp",
        &["g++"],
        "#include <iostream>\nint main() { std::cout << \"Hello, World!\" << std::endl; }\n",
    )
    .await;
}

#[tokio::test]
async fn test_hello_world_java() {
    assert_hello(
        "java",
        &["javac", "java"],
        "public class Main {\n  public static void main(String[] args) {\n    System.out.println(\"Hello, World!\");\n  }\n}\n",
    )
    .await;
}

#[tokio::test]
async fn test_stdin_reaches_program() {
    if !tool_available("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let coordinator = engine(root.path());
    let request = ExecutionRequest::new("python", "name = input()\nprint(f'Hello, {name}!')\n")
        .with_stdin("Ada\n");

    let result = execute(&coordinator, request).await.unwrap();

    assert_eq!(result.stdout(), "Hello, Ada!\n");
}

#[tokio::test]
async fn test_infinite_loop_times_out_with_partial_output() {
    if !tool_available("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let coordinator = engine(root.path());
    let request = ExecutionRequest::new("python", "print('started')\nwhile True:\n    pass\n")
        .with_limits(PartialLimits {
            wall_clock_ms: Some(500),
            ..PartialLimits::default()
        });

    let result = execute(&coordinator, request).await.unwrap();

    assert_eq!(result.status(), ExecutionStatus::Timeout);
    assert_eq!(result.exit_code(), None);
    assert!(matches!(result.killed_by(), Some(LimitKind::Wall | LimitKind::Cpu)));
    assert_eq!(result.stdout(), "started\n");
    assert!(result.run_duration_ms() < 3_000);
    assert_empty_dir(root.path());
}

#[tokio::test]
async fn test_sleep_forever_times_out() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = engine(root.path());
    let request = ExecutionRequest::new("bash", "echo before\nsleep 1000\n").with_limits(
        PartialLimits {
            wall_clock_ms: Some(300),
            ..PartialLimits::default()
        },
    );

    let result = execute(&coordinator, request).await.unwrap();

    assert_eq!(result.status(), ExecutionStatus::Timeout);
    assert_eq!(result.killed_by(), Some(LimitKind::Wall));
    assert_eq!(result.stdout(), "before\n");
}

#[tokio::test]
async fn test_unbounded_allocation_is_resource_exceeded() {
    if !tool_available("python3") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let coordinator = engine(root.path());
    let source = "import time\nchunks = []\nwhile True:\n    chunks.append(b'x' * (1 << 20))\n    time.sleep(0.001)\n";
    let request = ExecutionRequest::new("python", source).with_limits(PartialLimits {
        memory_bytes: Some(64 * 1024 * 1024),
        ..PartialLimits::default()
    });

    let result = execute(&coordinator, request).await.unwrap();

    assert_eq!(result.status(), ExecutionStatus::ResourceExceeded);
    assert_eq!(result.killed_by(), Some(LimitKind::Memory));
    assert_eq!(result.exit_code(), None);
}

#[tokio::test]
async fn test_output_flood_is_truncated() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = engine(root.path());
    let request = ExecutionRequest::new("bash", "while :; do echo flood; done\n").with_limits(
        PartialLimits {
            max_output_bytes: Some(4096),
            ..PartialLimits::default()
        },
    );

    let result = execute(&coordinator, request).await.unwrap();

    assert!(result.truncated());
    assert!(result.stdout().len() <= 4096);
    assert_eq!(result.status(), ExecutionStatus::ResourceExceeded);
    assert_eq!(result.killed_by(), Some(LimitKind::Output));
}

#[tokio::test]
async fn test_runtime_error_keeps_exit_code() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = engine(root.path());

    let result = execute(
        &coordinator,
        ExecutionRequest::new("bash", "echo failing >&2\nexit 7\n"),
    )
    .await
    .unwrap();

    assert_eq!(result.status(), ExecutionStatus::RuntimeError);
    assert_eq!(result.exit_code(), Some(7));
    assert_eq!(result.stderr(), "failing\n");
}

#[tokio::test]
async fn test_compile_error_reports_diagnostics() {
    if !tool_available("gcc") {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let coordinator = engine(root.path());

    let result = execute(
        &coordinator,
        ExecutionRequest::new("c", "int main(void) { return 0 }\n"),
    )
    .await
    .unwrap();

    assert_eq!(result.status(), ExecutionStatus::CompileError);
    assert_ne!(result.exit_code(), Some(0));
    assert!(result.stderr().contains("error"), "{}", result.stderr());
    assert_eq!(result.run_duration_ms(), 0);
    assert_empty_dir(root.path());
}

#[tokio::test]
async fn test_background_children_do_not_outlive_execution() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = engine(root.path());
    let token = format!("survivor-{}", uuid::Uuid::new_v4());
    let source = format!(
        "(sleep 30; : {token}) &\nsetsid sh -c 'sleep 30; : {token}' &\nsleep 1000\n"
    );
    let request = ExecutionRequest::new("bash", source).with_limits(PartialLimits {
        wall_clock_ms: Some(300),
        ..PartialLimits::default()
    });

    let result = execute(&coordinator, request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(result.status(), ExecutionStatus::Timeout);
    assert_eq!(processes_with_token(&token), Vec::<i32>::new());
}

#[tokio::test]
async fn test_detached_child_dies_with_a_fast_exiting_program() {
    if !confinement_available().await {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let coordinator = engine(root.path());
    let token = format!("orphan-{}", uuid::Uuid::new_v4());
    let source = format!("setsid sh -c 'sleep 30; : {token}' &\nexit 0\n");

    let result = execute(&coordinator, ExecutionRequest::new("bash", source))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(result.status(), ExecutionStatus::Success);
    assert_eq!(processes_with_token(&token), Vec::<i32>::new());
}

#[tokio::test]
async fn test_execution_cannot_write_outside_its_workspace() {
    if !confinement_available().await {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let outside = root.path().join("outside.txt");
    let coordinator = engine(&root.path().join("workspaces"));

    let victim = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let source = "echo mine > sentinel.txt\nsleep 1\ncat sentinel.txt\n";
            execute(&coordinator, ExecutionRequest::new("bash", source)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    let source = format!(
        "for d in ../{WORKSPACE_PREFIX}*; do\n\
         \x20 [ \"$d\" -ef . ] && continue\n\
         \x20 echo injected 2>/dev/null > \"$d/sentinel.txt\" && echo \"wrote $d\"\n\
         done\n\
         echo x 2>/dev/null > {} && echo wrote_outside\n\
         echo done\n",
        outside.display()
    );
    let attacker = execute(&coordinator, ExecutionRequest::new("bash", source))
        .await
        .unwrap();
    let victim = victim.await.unwrap().unwrap();

    assert_eq!(attacker.stdout(), "done\n");
    assert!(!outside.exists());
    assert_eq!(victim.status(), ExecutionStatus::Success);
    assert_eq!(victim.stdout(), "mine\n");
}

#[tokio::test]
async fn test_concurrent_executions_are_isolated() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = engine(root.path());

    let runs = (0..4).map(|i| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let source = format!(
                "echo sentinel-{i} > sentinel.txt\nsleep 0.3\nls\ncat sentinel.txt\n"
            );
            execute(&coordinator, ExecutionRequest::new("bash", source)).await
        })
    });
    let results = futures::future::join_all(runs).await;

    for (i, result) in results.into_iter().enumerate() {
        let result = result.unwrap().unwrap();
        assert_eq!(result.status(), ExecutionStatus::Success);
        let sentinel = format!("sentinel-{i}");
        let lines: Vec<&str> = result.stdout().lines().collect();
        assert_eq!(lines, vec!["main.sh", "sentinel.txt", sentinel.as_str()]);
    }
    assert_empty_dir(root.path());
}
