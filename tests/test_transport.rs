//! Transport tests: argument safety, the single-consumer stream, and
//! process lifecycle against harmless children.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use agent_cli_sdk::_internal::transport::{build_args, build_env, SubprocessTransport};
use agent_cli_sdk::{AgentOptions, SdkError, Transport, TransportError};

/// Adversarial strings that must survive byte-for-byte: anything a
/// shell would interpret must reach the argv untouched.
const INJECTION_CORPUS: &[&str] = &[
    "Don't stop",
    "$(echo pwned)",
    "`touch /tmp/pwned`",
    "a; rm -rf /",
    "| cat /etc/passwd",
    "two\nlines",
    "tab\there",
    "quote\"inside",
    "back\\slash",
    "&& echo chained",
    "*glob?",
    "~user/$HOME",
];

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .map(|i| args[i + 1].as_str())
}

#[test]
fn apostrophe_and_model_are_discrete_ordered_elements() {
    let options = AgentOptions::new()
        .with_system_prompt("Don't stop")
        .with_model("claude-sonnet");
    let args = build_args(&options, None);

    let sp = args.iter().position(|a| a == "--system-prompt").unwrap();
    let model = args.iter().position(|a| a == "--model").unwrap();
    assert_eq!(args[sp + 1], "Don't stop");
    assert_eq!(args[model + 1], "claude-sonnet");
    assert!(sp < model);
}

#[test]
fn executable_is_never_a_shell() {
    let exe = std::env::current_exe().unwrap();
    let mut options = AgentOptions::new().with_system_prompt("$(rm -rf /)");
    options.cli_path = Some(exe);

    let transport = SubprocessTransport::new(&options, None).unwrap();
    let name = transport
        .cli_path()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .to_string();
    assert!(!["sh", "bash", "zsh", "dash", "cmd.exe", "powershell.exe"]
        .contains(&name.as_str()));
    // The payload rides as an argument, not inside a command string.
    assert_eq!(
        flag_value(transport.args(), "--system-prompt"),
        Some("$(rm -rf /)")
    );
}

#[test]
fn injection_corpus_survives_every_user_valued_flag() {
    for payload in INJECTION_CORPUS {
        let mut options = AgentOptions::new();
        options.system_prompt = Some(payload.to_string());
        options.append_system_prompt = Some(payload.to_string());
        options.model = Some(payload.to_string());
        options.resume = Some(payload.to_string());
        options.allowed_tools = vec![payload.to_string()];
        options.disallowed_tools = vec![payload.to_string()];
        options.add_dirs = vec![PathBuf::from(payload)];
        options.settings = Some(payload.to_string());
        options.user = Some(payload.to_string());

        let args = build_args(&options, None);
        for flag in [
            "--system-prompt",
            "--append-system-prompt",
            "--model",
            "--resume",
            "--allowed-tools",
            "--disallowed-tools",
            "--add-dir",
            "--settings",
            "--user",
        ] {
            assert_eq!(
                flag_value(&args, flag),
                Some(*payload),
                "payload mangled for {flag}"
            );
        }
        // No argv element smuggles a joined command.
        assert!(args.iter().all(|a| !a.contains("--system-prompt ")));
    }
}

#[test]
fn env_values_pass_through_the_environment_map() {
    let mut options = AgentOptions::new();
    options.env = HashMap::from([
        ("INJECTED".to_string(), "$(echo pwned)".to_string()),
        ("SPACED".to_string(), "a b c".to_string()),
    ]);
    let env = build_env(&options);

    assert_eq!(env.get("INJECTED").map(String::as_str), Some("$(echo pwned)"));
    assert_eq!(env.get("SPACED").map(String::as_str), Some("a b c"));
    assert_eq!(env.get("AGENT_SDK").map(String::as_str), Some("true"));
}

#[test]
fn missing_cli_is_a_spawn_failure() {
    let mut options = AgentOptions::new();
    options.cli_path = Some(PathBuf::from("/definitely/not/here/agent-cli"));
    let err = SubprocessTransport::new(&options, None).unwrap_err();
    assert!(matches!(
        err,
        SdkError::Transport(TransportError::SpawnFailed { .. })
    ));
}

#[cfg(unix)]
mod process {
    use super::*;
    use tokio_stream::StreamExt;

    // `true` and `false` ignore the argv skeleton, making them
    // predictable stand-ins for the CLI.
    fn transport_for(child: &str) -> Arc<SubprocessTransport> {
        let mut options = AgentOptions::new();
        options.cli_path = Some(PathBuf::from(child));
        Arc::new(SubprocessTransport::new(&options, None).unwrap())
    }

    #[tokio::test]
    async fn write_before_start_is_not_connected() {
        let transport = transport_for("/bin/true");
        let err = transport.write(b"{}\n").await.unwrap_err();
        assert!(matches!(
            err,
            SdkError::Transport(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn second_consumer_is_rejected_first_stays_healthy() {
        let transport = transport_for("/bin/true");
        transport.start().await.unwrap();

        let mut first = transport.read_messages();
        let mut second = transport.read_messages();

        // The second stream fails immediately.
        match second.next().await {
            Some(Err(SdkError::Transport(TransportError::AlreadyConsumed))) => {}
            other => panic!("expected AlreadyConsumed, got {other:?}"),
        }
        assert!(second.next().await.is_none());

        // The first stream lives on and ends cleanly with the child.
        while let Some(item) = first.next().await {
            item.expect("healthy stream");
        }
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn clean_exit_finishes_stream_without_error() {
        let transport = transport_for("/bin/true");
        transport.start().await.unwrap();

        let mut stream = transport.read_messages();
        while let Some(item) = stream.next().await {
            item.expect("true exits zero; stream must finish cleanly");
        }
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_process_exited() {
        let transport = transport_for("/bin/false");
        transport.start().await.unwrap();

        let mut stream = transport.read_messages();
        let mut saw_exit_error = false;
        while let Some(item) = stream.next().await {
            if let Err(SdkError::Transport(TransportError::ProcessExited { code })) = item {
                assert_eq!(code, Some(1));
                saw_exit_error = true;
            }
        }
        assert!(saw_exit_error, "stream must finish with ProcessExited");
    }

    #[tokio::test]
    async fn concurrent_close_is_observed_once() {
        let transport = transport_for("/bin/true");
        transport.start().await.unwrap();

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move { transport.close().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(!transport.is_connected());
        // Still safe afterwards.
        transport.close().await.unwrap();

        let err = transport.write(b"{}\n").await.unwrap_err();
        assert!(matches!(
            err,
            SdkError::Transport(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn close_before_start_and_double_start() {
        let transport = transport_for("/bin/true");
        transport.close().await.unwrap();
        // Closed before ever starting; starting now is refused.
        assert!(transport.start().await.is_err());

        let transport = transport_for("/bin/true");
        transport.start().await.unwrap();
        assert!(transport.start().await.is_err());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn end_input_is_idempotent_and_harmless() {
        let transport = transport_for("/bin/true");
        transport.end_input().await.unwrap();

        transport.start().await.unwrap();
        transport.end_input().await.unwrap();
        transport.end_input().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_releases_the_child() {
        let transport = transport_for("/bin/true");
        transport.start().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());

        // The stream was finished by whoever reaped the child; a fresh
        // consumer call still answers deterministically.
        let mut stream = transport.read_messages();
        while let Some(item) = stream.next().await {
            // Either nothing (already consumed marker) or the clean end.
            if let Err(e) = item {
                assert!(matches!(
                    e,
                    SdkError::Transport(
                        TransportError::AlreadyConsumed | TransportError::ProcessExited { .. }
                    )
                ));
            }
        }
    }
}
