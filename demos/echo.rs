//! Self-contained demo: one editing context, a subscriber, and a few
//! commands, including ones that fail.
//!
//! Run with: `cargo run --example echo`
//!
//! Set `RUST_LOG=sirius_dispatch=debug` to watch the session lane.

use std::sync::{Arc, Mutex};

use serde_json::json;
use sirius_dispatch::{
    ChangeKind, Command, ContextError, Dispatcher, EditingContextId, FnHandler, Handled, Handler,
    HandlerError, Input,
};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// A trivially small "model": an ordered list of labels.
#[derive(Debug, Default)]
struct Board {
    labels: Mutex<Vec<String>>,
}

/// Adds a label to the board.
struct AddLabel;

#[async_trait::async_trait]
impl Handler<Board> for AddLabel {
    fn can_handle(&self, _board: &Board, command: &Command) -> bool {
        command.kind() == "add_label"
    }

    async fn handle(&self, board: &Board, command: &Command) -> Result<Handled, HandlerError> {
        let label: String = command.input().data_as()?;
        let count = {
            let mut labels = board
                .labels
                .lock()
                .map_err(|_| HandlerError::other("board lock poisoned"))?;
            labels.push(label);
            labels.len()
        };
        Ok(Handled::success(json!({ "labels": count })).with_change(ChangeKind::SEMANTIC_CHANGE))
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let board = Arc::new(Board::default());
    let dispatcher = Dispatcher::builder(move |_id: &EditingContextId| {
        Ok::<_, ContextError>(Arc::clone(&board))
    })
    .handler(FnHandler::new("echo", |_board: &Board, text: String| {
        Box::pin(async move { Ok::<_, HandlerError>(Handled::success(json!(text)).with_change("echoed")) })
    }))
    .handler(AddLabel)
    .build();

    let ctx = EditingContextId::new("board-1");
    let mut changes = dispatcher
        .subscribe(&ctx)
        .await
        .expect("subscribing to a loadable context should succeed");

    let commands = [
        Command::new("c1", Input::new("echo", json!("hello"))),
        Command::new("c2", Input::new("add_label", json!("todo"))),
        Command::new("c3", Input::new("add_label", json!("done"))),
        Command::new("c4", Input::new("rename_board", json!("x"))),
    ];
    for command in commands {
        let result = dispatcher.submit(&ctx, command).await;
        println!(
            "{} -> {}",
            result.correlation_id,
            serde_json::to_string(&result.outcome).unwrap_or_default()
        );
    }

    dispatcher.shutdown().await;
    while let Some(change) = changes.recv().await {
        match change {
            Ok(event) => println!(
                "event #{} on {}: {} (caused by {})",
                event.sequence, event.context_id, event.kind, event.cause
            ),
            Err(failure) => println!("subscription failed: {failure}"),
        }
    }
}
