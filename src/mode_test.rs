use super::*;
use crate::store::MemoryStore;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Default)]
struct MockProbe {
    server: Option<AuthMode>,
    cookie: Option<Result<bool, ApiError>>,
    header_token: bool,
    header: Option<Result<bool, ApiError>>,
    server_calls: AtomicU32,
    cookie_calls: AtomicU32,
}

#[async_trait]
impl ModeProbe for MockProbe {
    async fn server_preference(&self) -> Option<AuthMode> {
        self.server_calls.fetch_add(1, Ordering::SeqCst);
        self.server
    }

    async fn cookie_works(&self) -> Result<bool, ApiError> {
        self.cookie_calls.fetch_add(1, Ordering::SeqCst);
        self.cookie.clone().unwrap_or(Ok(false))
    }

    fn has_header_token(&self) -> bool {
        self.header_token
    }

    async fn header_works(&self) -> Result<bool, ApiError> {
        self.header.clone().unwrap_or(Ok(false))
    }
}

fn network_down() -> ApiError {
    ApiError::Network("connection refused".into())
}

struct Harness {
    resolver: ModeResolver,
    probe: Arc<MockProbe>,
    session: Arc<MemoryStore>,
    durable: Arc<MemoryStore>,
}

fn harness(probe: MockProbe, overrides: ModeOverrides) -> Harness {
    let probe = Arc::new(probe);
    let session = Arc::new(MemoryStore::new());
    let durable = Arc::new(MemoryStore::new());
    let resolver = ModeResolver::new(probe.clone(), overrides, session.clone(), durable.clone());
    Harness { resolver, probe, session, durable }
}

#[tokio::test]
async fn query_override_wins_over_every_other_signal() {
    let h = harness(
        MockProbe { server: Some(AuthMode::Cookie), cookie: Some(Ok(true)), ..MockProbe::default() },
        ModeOverrides {
            page_url: Some("https://app.example.test/chat?auth_mode=header&x=1".into()),
            forced_mode: Some(AuthMode::Cookie),
            preferred_mode: Some(AuthMode::Cookie),
            ..ModeOverrides::default()
        },
    );

    let resolution = h.resolver.resolve_detailed().await;
    assert_eq!(resolution, ModeResolution { mode: AuthMode::Header, source: ResolutionSource::Override });
    assert_eq!(h.probe.server_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.probe.cookie_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn debug_flag_applies_when_url_has_no_override() {
    let h = harness(
        MockProbe::default(),
        ModeOverrides {
            page_url: Some("https://app.example.test/?auth_mode=bogus".into()),
            debug_mode: Some(AuthMode::Header),
            ..ModeOverrides::default()
        },
    );
    assert_eq!(h.resolver.resolve().await, AuthMode::Header);
}

#[tokio::test]
async fn server_preference_beats_environment() {
    let h = harness(
        MockProbe { server: Some(AuthMode::Header), ..MockProbe::default() },
        ModeOverrides { forced_mode: Some(AuthMode::Cookie), ..ModeOverrides::default() },
    );
    let resolution = h.resolver.resolve_detailed().await;
    assert_eq!(resolution.mode, AuthMode::Header);
    assert_eq!(resolution.source, ResolutionSource::Server);
}

#[tokio::test]
async fn environment_mode_skips_probing() {
    let h = harness(
        MockProbe::default(),
        ModeOverrides { forced_mode: Some(AuthMode::Header), ..ModeOverrides::default() },
    );
    assert_eq!(h.resolver.resolve_detailed().await.source, ResolutionSource::Environment);
    assert_eq!(h.probe.cookie_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn probe_picks_the_only_working_transport() {
    let h = harness(
        MockProbe { cookie: Some(Ok(false)), header_token: true, header: Some(Ok(true)), ..MockProbe::default() },
        ModeOverrides::default(),
    );
    let resolution = h.resolver.resolve_detailed().await;
    assert_eq!(resolution, ModeResolution { mode: AuthMode::Header, source: ResolutionSource::Probe });
}

#[tokio::test]
async fn probe_prefers_environment_default_when_both_work() {
    let h = harness(
        MockProbe { cookie: Some(Ok(true)), header_token: true, header: Some(Ok(true)), ..MockProbe::default() },
        ModeOverrides { preferred_mode: Some(AuthMode::Header), ..ModeOverrides::default() },
    );
    assert_eq!(h.resolver.resolve().await, AuthMode::Header);
}

#[tokio::test]
async fn probe_prefers_environment_default_when_neither_works() {
    let h = harness(
        MockProbe { cookie: Some(Ok(false)), ..MockProbe::default() },
        ModeOverrides { preferred_mode: Some(AuthMode::Header), ..ModeOverrides::default() },
    );
    let resolution = h.resolver.resolve_detailed().await;
    assert_eq!(resolution, ModeResolution { mode: AuthMode::Header, source: ResolutionSource::Probe });
}

#[tokio::test]
async fn inconclusive_probe_falls_back_to_last_known_good() {
    let h = harness(MockProbe { cookie: Some(Err(network_down())), ..MockProbe::default() }, ModeOverrides::default());
    h.durable.set(LAST_GOOD_MODE_KEY, "header");

    let resolution = h.resolver.resolve_detailed().await;
    assert_eq!(resolution, ModeResolution { mode: AuthMode::Header, source: ResolutionSource::LastKnownGood });
}

#[tokio::test]
async fn everything_failing_defaults_to_cookie() {
    let h = harness(
        MockProbe {
            cookie: Some(Err(network_down())),
            header_token: true,
            header: Some(Err(network_down())),
            ..MockProbe::default()
        },
        ModeOverrides::default(),
    );
    let resolution = h.resolver.resolve_detailed().await;
    assert_eq!(resolution, ModeResolution { mode: AuthMode::Cookie, source: ResolutionSource::Default });
}

#[tokio::test]
async fn resolution_is_cached_for_the_session() {
    let h = harness(MockProbe { cookie: Some(Ok(true)), ..MockProbe::default() }, ModeOverrides::default());

    assert_eq!(h.resolver.resolve().await, AuthMode::Cookie);
    assert_eq!(h.resolver.resolve().await, AuthMode::Cookie);
    assert_eq!(h.probe.server_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.get(MODE_KEY).as_deref(), Some("cookie"));
}

#[tokio::test]
async fn session_cache_short_circuits_a_fresh_resolver() {
    let h = harness(MockProbe::default(), ModeOverrides::default());
    h.session.set(MODE_KEY, "header");

    let resolution = h.resolver.resolve_detailed().await;
    assert_eq!(resolution, ModeResolution { mode: AuthMode::Header, source: ResolutionSource::Cached });
    assert_eq!(h.probe.server_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn force_replaces_cached_mode() {
    let h = harness(MockProbe { cookie: Some(Ok(true)), ..MockProbe::default() }, ModeOverrides::default());
    assert_eq!(h.resolver.resolve().await, AuthMode::Cookie);

    h.resolver.force(AuthMode::Header).await;
    assert_eq!(h.resolver.resolve_detailed().await.source, ResolutionSource::Forced);
    assert_eq!(h.resolver.current().await, Some(AuthMode::Header));
    assert_eq!(h.session.get(MODE_KEY).as_deref(), Some("header"));
}

#[tokio::test]
async fn record_known_good_writes_durable_store() {
    let h = harness(MockProbe::default(), ModeOverrides::default());
    h.resolver.record_known_good(AuthMode::Header);
    assert_eq!(h.durable.get(LAST_GOOD_MODE_KEY).as_deref(), Some("header"));
}

#[test]
fn query_override_ignores_unrelated_params() {
    assert_eq!(query_override("http://localhost/?mode=header"), None);
    assert_eq!(query_override("not a url"), None);
    assert_eq!(query_override("http://localhost/?auth_mode=cookie"), Some(AuthMode::Cookie));
}
