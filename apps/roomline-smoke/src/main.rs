use std::env;
use std::sync::Arc;

use roomline_core::{EventTypeFilter, Filter, RoomFilter, TimelineFilter};
use roomline_matrix::{stream, CommandQueue, FilterSource, HttpApi, SyncEngine};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod logging;

#[tokio::main]
async fn main() {
    logging::init();

    let homeserver = env::var("ROOMLINE_HOMESERVER")
        .unwrap_or_else(|_| "https://matrix.example.org".to_owned());
    let (Ok(user), Ok(password)) = (env::var("ROOMLINE_USER"), env::var("ROOMLINE_PASSWORD"))
    else {
        println!("roomline smoke runner");
        println!("Set ROOMLINE_HOMESERVER, ROOMLINE_USER and ROOMLINE_PASSWORD to run live.");
        println!("Optional: ROOMLINE_ROOMS (comma-separated room IDs to restrict the stream),");
        println!("          ROOMLINE_ANNOUNCE_ROOM (room to post a test message into).");
        return;
    };

    let credentials =
        match HttpApi::login_with_password(&homeserver, &user, &password, Some("roomline-smoke"))
            .await
        {
            Ok(credentials) => credentials,
            Err(err) => {
                error!(error = %err, "login failed");
                std::process::exit(1);
            }
        };
    info!(user_id = %credentials.user_id, "logged in");

    let api = match HttpApi::new(credentials) {
        Ok(api) => Arc::new(api),
        Err(err) => {
            error!(error = %err, "client setup failed");
            std::process::exit(1);
        }
    };

    let commands = CommandQueue::new();
    let cancel = CancellationToken::new();
    let delivery = commands.spawn_delivery(Arc::clone(&api), cancel.clone());

    if let Ok(room_id) = env::var("ROOMLINE_ANNOUNCE_ROOM") {
        let scheduled = commands.schedule(
            "send_message_event",
            vec![
                json!(room_id),
                json!("m.room.message"),
                json!({ "msgtype": "m.text", "body": "roomline smoke run" }),
            ],
        );
        if let Err(err) = scheduled {
            error!(error = %err, "scheduling the announcement failed");
        }
    }

    let mut batches = stream(
        SyncEngine::new(Arc::clone(&api)),
        None,
        FilterSource::Fixed(smoke_filter()),
        &cancel,
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping");
                cancel.cancel();
                break;
            }
            next = batches.next() => match next {
                Some(Ok(batch)) => {
                    for (room_id, events) in &batch.events {
                        info!(room = %room_id, events = events.len(), "batch received");
                    }
                    info!(next_batch = %batch.next_batch, "cursor advanced");
                }
                Some(Err(err)) => error!(error = %err, "poll failed"),
                None => break,
            }
        }
    }

    batches.stop().await;
    let _ = delivery.await;
}

fn smoke_filter() -> Filter {
    let rooms = env::var("ROOMLINE_ROOMS").ok().map(|raw| {
        raw.split(',')
            .map(|room| room.trim().to_owned())
            .filter(|room| !room.is_empty())
            .collect::<Vec<_>>()
    });

    Filter {
        account_data: Some(EventTypeFilter::exclude_all()),
        room: Some(RoomFilter {
            rooms,
            timeline: Some(TimelineFilter {
                limit: Some(64),
                lazy_load_members: Some(true),
                ..TimelineFilter::default()
            }),
            ephemeral: Some(EventTypeFilter::exclude_all()),
        }),
    }
}
