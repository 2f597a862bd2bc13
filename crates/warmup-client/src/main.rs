use anyhow::Context;
use clap::Parser;
use std::time::Instant;
use tracing::info;
use warmup_client::{
    build_transport,
    config::{load_config, Args, Cmd},
    dispatcher::{CommandDispatcher, UiEvent},
    logging::init_logging,
    view::{render, FollowState},
};
use warmup_core::{CommandKind, Target};

fn print(event: &UiEvent) {
    for line in render(event) {
        println!("{line}");
    }
}

fn is_outcome_for(event: &UiEvent, client_id: &str) -> Option<bool> {
    match event {
        UiEvent::Acknowledged { command, .. } if command.client_id == client_id => Some(true),
        UiEvent::Rejected { command, .. }
        | UiEvent::NotAcknowledged(command)
        | UiEvent::Unsent { command, .. }
            if command.client_id == client_id =>
        {
            Some(false)
        }
        _ => None,
    }
}

async fn run(cmd: Cmd, dispatcher: &mut CommandDispatcher) -> i32 {
    match cmd {
        Cmd::Warmup { target, follow } => {
            let target = Target::parse(&target);
            let client_id = dispatcher.issue(CommandKind::Warmup, target.clone()).await;
            let mut tracker = FollowState::new(client_id.clone(), target);
            loop {
                let event = dispatcher.next_event().await;
                print(&event);
                tracker.observe(&event);
                match is_outcome_for(&event, &client_id) {
                    Some(false) => return 1,
                    Some(true) if !follow => return 0,
                    _ => {}
                }
                if follow && tracker.is_done() {
                    return if tracker.failed().is_empty() { 0 } else { 1 };
                }
            }
        }
        Cmd::Status => {
            let client_id = dispatcher.issue(CommandKind::QueryStatus, Target::All).await;
            loop {
                let event = dispatcher.next_event().await;
                match (&event, is_outcome_for(&event, &client_id)) {
                    (UiEvent::Snapshot { .. }, _) | (UiEvent::TierChanged { .. }, _) => {
                        print(&event)
                    }
                    (_, Some(ok)) => {
                        if !ok {
                            print(&event);
                        }
                        return if ok { 0 } else { 1 };
                    }
                    _ => {}
                }
            }
        }
        Cmd::Ping => {
            let started = Instant::now();
            let client_id = dispatcher.issue(CommandKind::Ping, Target::All).await;
            loop {
                let event = dispatcher.next_event().await;
                match is_outcome_for(&event, &client_id) {
                    Some(true) => {
                        let tier = dispatcher
                            .active_tier()
                            .map(|tier| tier.label())
                            .unwrap_or("offline");
                        println!("[{tier}] pong in {} ms", started.elapsed().as_millis());
                        return 0;
                    }
                    Some(false) => {
                        print(&event);
                        return 1;
                    }
                    None => {}
                }
            }
        }
        Cmd::Watch => loop {
            let event = dispatcher.next_event().await;
            print(&event);
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(config.log_stdout);

    let transport = build_transport(&config).context("building transports")?;
    let mut dispatcher = CommandDispatcher::new(transport, config.ack_timeout);
    match dispatcher.start().await {
        Ok(tier) => info!(event = "client_start", tier = %tier),
        Err(err) => {
            eprintln!("no transport available: {err}");
            std::process::exit(2);
        }
    }

    let code = tokio::select! {
        code = run(args.command, &mut dispatcher) => code,
        _ = tokio::signal::ctrl_c() => 130,
    };
    dispatcher.close();
    std::process::exit(code);
}
