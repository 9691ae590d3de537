// tests/player_test.rs
mod common;

use common::{eventually, local_client, serve, tagged_wav, FakeBackend, Reply};
use podbit::downloader::Downloader;
use podbit::event::EventBus;
use podbit::ledger::{ResumeLedger, LEDGER_FILENAME};
use podbit::playback::PlaybackQueue;
use podbit::player::{Player, PlayerState, Services};
use podbit::queue::{EpisodeState, QueueStore, UnknownPodcasts};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const TICK: Duration = Duration::from_millis(20);

struct Harness {
    _dir: TempDir,
    services: Services,
    backend: FakeBackend,
    player: Player,
    mainloop: tokio::task::JoinHandle<()>,
}

impl Harness {
    /// `episodes` are (url, file name, present on disk)
    fn new(episodes: &[(&str, &str, bool)]) -> Self {
        let dir = TempDir::new().unwrap();
        let mut lines = String::new();
        for (url, name, present) in episodes {
            let path = dir.path().join(name);
            if *present {
                fs::write(&path, b"audio").unwrap();
            }
            lines.push_str(&format!("{} \"{}\"\n", url, path.display()));
        }
        let queue_path = dir.path().join("queue");
        fs::write(&queue_path, lines).unwrap();

        let ledger = Arc::new(ResumeLedger::open(dir.path().join(LEDGER_FILENAME)).unwrap());
        let store = Arc::new(
            QueueStore::open(&queue_path, Arc::clone(&ledger), Arc::new(UnknownPodcasts)).unwrap(),
        );
        let events = Arc::new(EventBus::new());
        let downloader = Arc::new(Downloader::with_client(
            local_client(),
            Arc::clone(&events),
            vec![],
        ));

        let services = Services {
            queue: Arc::new(PlaybackQueue::new()),
            store,
            ledger,
            downloader,
            events: Arc::clone(&events),
        };
        let backend = FakeBackend::new();
        let (player, mainloop) = Player::spawn(services.clone(), backend.clone(), TICK);
        events.start();

        Self {
            _dir: dir,
            services,
            backend,
            player,
            mainloop,
        }
    }

    fn path_of(&self, url: &str) -> PathBuf {
        self.services.store.get_by_url(url).unwrap().path().to_path_buf()
    }

    fn enqueue(&self, url: &str) {
        assert!(self.services.queue.enqueue_by_url(&self.services.store, url));
    }

    async fn wait_state(&self, state: PlayerState) -> bool {
        eventually(move || async move { self.player.state().await.unwrap() == state }).await
    }

    async fn wait_loads(&self, count: usize) -> bool {
        eventually(move || async move { self.loads().len() == count }).await
    }

    fn loads(&self) -> Vec<(PathBuf, u64)> {
        self.backend.state.lock().unwrap().loads.clone()
    }
}

#[tokio::test]
async fn test_plays_in_order_and_marks_finished() {
    let h = Harness::new(&[("https://a/1", "one.mp3", true), ("https://a/2", "two.mp3", true)]);
    h.services.ledger.resume(h.path_of("https://a/1"), 42).unwrap();
    h.enqueue("https://a/1");
    h.enqueue("https://a/2");

    assert!(h.wait_state(PlayerState::Playing).await);
    assert_eq!(h.loads(), vec![(h.path_of("https://a/1"), 42)]);
    let first = h.services.store.get_by_url("https://a/1").unwrap();
    assert_eq!(first.state(), EpisodeState::Played);
    assert!(h.player.is_playing().await.unwrap());
    assert!(!h.player.is_paused().await.unwrap());

    let now = h.player.now_playing().await.unwrap();
    assert_eq!(now.title, "one");
    assert_eq!(now.podcast, "Unrecognised");
    assert_eq!(h.player.timings().await.unwrap(), (42.0, 600.0));

    h.backend.finish_track();
    assert!(h.wait_loads(2).await);
    assert_eq!(first.state(), EpisodeState::Finished);
    assert_eq!(h.loads()[1], (h.path_of("https://a/2"), 0));
    let (_, resume) = h.services.ledger.raw_stat(first.path()).unwrap();
    assert_eq!(resume, 0);

    h.backend.finish_track();
    assert!(h.wait_state(PlayerState::Idle).await);
    assert_eq!(h.player.now_playing().await.unwrap(), Default::default());
    assert_eq!(h.services.queue.head(), 2);

    h.player.destroy().await.unwrap();
    h.mainloop.await.unwrap();
    assert!(h.backend.state.lock().unwrap().shutdown);
}

#[tokio::test]
async fn test_stop_saves_position_without_finishing() {
    let h = Harness::new(&[("https://a/1", "one.mp3", true)]);
    h.enqueue("https://a/1");
    assert!(h.wait_state(PlayerState::Playing).await);

    h.player.pause().await.unwrap();
    assert!(h.player.is_paused().await.unwrap());
    h.player.toggle().await.unwrap();
    assert!(!h.player.is_paused().await.unwrap());
    h.player.seek(-5).await.unwrap();

    h.backend.set_position(125.7);
    h.player.stop().await.unwrap();
    assert!(h.wait_state(PlayerState::Idle).await);

    let ep = h.services.store.get_by_url("https://a/1").unwrap();
    assert_eq!(ep.state(), EpisodeState::Played);
    let (_, resume) = h.services.ledger.raw_stat(ep.path()).unwrap();
    assert_eq!(resume, 125);
    {
        let state = h.backend.state.lock().unwrap();
        assert_eq!(state.stops, 1);
        assert_eq!(state.seeks, vec![-5]);
    }
    assert_eq!(h.player.timings().await.unwrap(), (0.0, 0.0));

    // The queue does not wrap around after the last episode
    tokio::time::sleep(TICK * 5).await;
    assert_eq!(h.loads().len(), 1);

    h.player.destroy().await.unwrap();
}

#[tokio::test]
async fn test_transport_commands_are_ignored_when_idle() {
    let h = Harness::new(&[]);

    h.player.pause().await.unwrap();
    h.player.seek(10).await.unwrap();
    h.player.stop().await.unwrap();
    assert_eq!(h.player.state().await.unwrap(), PlayerState::Idle);
    assert!(!h.player.is_paused().await.unwrap());
    assert!(!h.player.is_waiting().await.unwrap());

    // An out-of-range jump leaves everything alone
    h.player.jump_to(5).await.unwrap();
    assert_eq!(h.services.queue.head(), 0);
    {
        let state = h.backend.state.lock().unwrap();
        assert!(state.seeks.is_empty());
        assert_eq!(state.stops, 0);
    }

    h.player.destroy().await.unwrap();
    h.mainloop.await.unwrap();
    assert!(matches!(h.player.state().await, Err(podbit::AppError::PlayerGone)));
    // Destroying twice is harmless
    h.player.destroy().await.unwrap();
}

#[tokio::test]
async fn test_out_of_range_jump_keeps_playing() {
    let h = Harness::new(&[("https://a/1", "one.mp3", true), ("https://a/2", "two.mp3", true)]);
    h.enqueue("https://a/1");
    h.enqueue("https://a/2");
    assert!(h.wait_state(PlayerState::Playing).await);
    assert_eq!(h.services.queue.head(), 1);

    h.player.jump_to(7).await.unwrap();
    tokio::time::sleep(TICK * 3).await;

    assert_eq!(h.player.state().await.unwrap(), PlayerState::Playing);
    assert_eq!(h.services.queue.head(), 1);
    assert_eq!(h.loads().len(), 1);
    assert_eq!(h.backend.state.lock().unwrap().stops, 0);
    assert_eq!(h.player.now_playing().await.unwrap().title, "one");

    h.player.destroy().await.unwrap();
}

#[tokio::test]
async fn test_jump_and_dequeue_route_through_the_mainloop() {
    let h = Harness::new(&[
        ("https://a/1", "one.mp3", true),
        ("https://a/2", "two.mp3", true),
        ("https://a/3", "three.mp3", true),
    ]);
    h.enqueue("https://a/1");
    h.enqueue("https://a/2");
    h.enqueue("https://a/3");
    assert!(h.wait_state(PlayerState::Playing).await);

    h.player.jump_to(2).await.unwrap();
    assert!(h.wait_loads(2).await);
    assert_eq!(h.loads()[1].0, h.path_of("https://a/3"));
    // Jumping away is a manual stop
    assert_eq!(h.services.store.get_by_url("https://a/1").unwrap().state(), EpisodeState::Played);

    // Removing the playing entry stops it; nothing is left after it
    h.player.dequeue(2).await.unwrap();
    assert!(h.wait_state(PlayerState::Idle).await);
    assert_eq!(h.services.queue.len(), 2);
    assert_eq!(h.services.queue.head(), 2);

    h.player.destroy().await.unwrap();
}

#[tokio::test]
async fn test_waits_for_download_then_plays() {
    let url = serve(Reply::Body(b"fresh audio".to_vec())).await;
    let episode_url = format!("{}/remote.mp3", url);
    let h = Harness::new(&[(&episode_url, "remote.mp3", false)]);
    let ep = h.services.store.get_by_url(&episode_url).unwrap();
    assert_eq!(ep.state(), EpisodeState::Pending);

    h.enqueue(&episode_url);
    assert!(h.wait_state(PlayerState::Playing).await);

    assert_eq!(fs::read(ep.path()).unwrap(), b"fresh audio");
    assert_eq!(h.loads(), vec![(ep.path().to_path_buf(), 0)]);
    assert_eq!(ep.state(), EpisodeState::Played);
    assert_eq!(h.services.downloader.downloads().len(), 1);

    h.player.destroy().await.unwrap();
}

#[tokio::test]
async fn test_now_playing_uses_tags_of_fresh_download() {
    let url = serve(Reply::Body(tagged_wav("Async in Depth", "Ferris"))).await;
    let episode_url = format!("{}/ep7.mp3", url);
    let h = Harness::new(&[(&episode_url, "ep7.mp3", false)]);
    let ep = h.services.store.get_by_url(&episode_url).unwrap();
    assert_eq!(ep.title(), "ep7");

    h.enqueue(&episode_url);
    assert!(h.wait_state(PlayerState::Playing).await);

    assert_eq!(ep.title(), "Async in Depth");
    assert_eq!(ep.host().as_deref(), Some("Ferris"));
    assert_eq!(h.player.now_playing().await.unwrap().title, "Async in Depth");
    let found = h.services.store.get_by_title("Async in Depth").unwrap();
    assert!(Arc::ptr_eq(&found, &ep));

    h.player.destroy().await.unwrap();
}

#[tokio::test]
async fn test_failed_download_is_skipped() {
    let url = serve(Reply::Status(500)).await;
    let bad_url = format!("{}/gone.mp3", url);
    let h = Harness::new(&[(&bad_url, "gone.mp3", false), ("https://a/2", "two.mp3", true)]);
    h.enqueue(&bad_url);
    h.enqueue("https://a/2");

    assert!(h.wait_state(PlayerState::Playing).await);
    assert_eq!(h.loads(), vec![(h.path_of("https://a/2"), 0)]);
    let status = h.services.downloader.get_download(0).unwrap();
    assert_eq!(status.error, "Download failed");

    h.player.destroy().await.unwrap();
}
