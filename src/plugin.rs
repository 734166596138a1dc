//! Authentication plugin binding.
//!
//! The host supplies an [`AuthPlugin`] implementation; every worker binds
//! to it through a [`PluginBinding`] that owns the plugin's opaque
//! per-thread memory. The lifecycle contract:
//!
//! - `allocate_thread_memory` runs exactly once per worker, before the
//!   first `init`; `deallocate_thread_memory` exactly once on worker
//!   exit, matched even when the event loop dies on a fatal error.
//! - A config reload runs `deinit(reloading=true)` then
//!   `init(reloading=true)` without re-allocating thread memory.
//! - Every login, ACL decision, extended-auth step and periodic tick
//!   executes on the owning worker thread with that worker's memory.
//!
//! Plugin failures (an `Err` or a panic) never unwind into the event
//! loop: checks are converted to [`AuthResult::Error`] and logged.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::message::{QoS, UserProperty};
use crate::settings::PluginSettings;

/// Compiled-in plugin interface version. `AuthPlugin::plugin_version`
/// must return exactly this value.
pub const PLUGIN_VERSION: i32 = 1;

// Log levels accepted by the plugin log callback. Numbering is kept
// compatible with Mosquitto-style plugins.
pub const LOG_NONE: u8 = 0x00;
pub const LOG_INFO: u8 = 0x01;
pub const LOG_NOTICE: u8 = 0x02;
pub const LOG_WARNING: u8 = 0x04;
pub const LOG_ERR: u8 = 0x08;
pub const LOG_DEBUG: u8 = 0x10;
pub const LOG_SUBSCRIBE: u8 = 0x20;
pub const LOG_UNSUBSCRIBE: u8 = 0x40;

/// Log callback handed to plugins. Routes into the broker's logger;
/// INFO and NOTICE are not distinguished.
pub fn plugin_log(level: u8, msg: &str) {
    match level {
        LOG_ERR => log::error!("[plugin] {}", msg),
        LOG_WARNING => log::warn!("[plugin] {}", msg),
        LOG_DEBUG => log::debug!("[plugin] {}", msg),
        _ => log::info!("[plugin] {}", msg),
    }
}

/// Result of a plugin auth decision. The integer values are stable ABI,
/// compatible with Mosquitto's auth results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AuthResult {
    Success = 0,
    AuthMethodNotSupported = 10,
    LoginDenied = 11,
    AclDenied = 12,
    Error = 13,
    /// Valid only during an extended-auth handshake.
    AuthContinue = -4,
}

/// Access type for ACL checks. Numbering is Mosquitto-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AclAccess {
    None = 0,
    /// Receiving a publish someone else published.
    Read = 1,
    /// Publishing.
    Write = 2,
    /// Subscribing.
    Subscribe = 4,
}

/// Stage of an MQTT 5 extended-auth exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExtendedAuthStage {
    None = 0,
    Auth = 10,
    Reauth = 20,
    Continue = 30,
}

/// Options handed to the plugin, from `plugin.options` in the config file.
pub type PluginOpts = HashMap<String, String>;

/// Opaque per-worker plugin memory.
pub type ThreadMemory = Box<dyn Any + Send>;

/// Metadata of the message an ACL check is about. `subtopics` is the
/// topic pre-split on '/' so plugins don't have to.
#[derive(Debug)]
pub struct AclRequest<'a> {
    pub topic: &'a str,
    pub subtopics: &'a [String],
    pub qos: QoS,
    pub retain: bool,
    pub user_properties: Option<&'a [UserProperty]>,
}

/// The host-provided authentication plugin.
///
/// Implementations should treat each worker as its own domain: the
/// `memory` handle passed to every call is the one allocated on that
/// worker. Plugins that must share state across workers provide their
/// own locking.
pub trait AuthPlugin: Send + Sync + 'static {
    /// Must return [`PLUGIN_VERSION`].
    fn plugin_version(&self) -> i32 {
        PLUGIN_VERSION
    }

    /// Allocate per-worker memory. Called once per worker, never again.
    /// Only allocate here; opening connections belongs in `init`,
    /// because the reload mechanism does not re-run this.
    fn allocate_thread_memory(&self, opts: &PluginOpts) -> Result<ThreadMemory>;

    /// Free per-worker memory. Called once per worker, never again.
    fn deallocate_thread_memory(&self, memory: ThreadMemory, opts: &PluginOpts);

    /// Main initialization point; runs on worker start and on every reload.
    fn init(&self, memory: &mut ThreadMemory, opts: &PluginOpts, reloading: bool) -> Result<()>;

    /// Precursor to `init`; runs on worker stop and on every reload.
    fn deinit(&self, memory: &mut ThreadMemory, opts: &PluginOpts, reloading: bool) -> Result<()>;

    /// Called every `plugin.timer_period` seconds, queued in each worker
    /// at about the same time. Runs in the event loop; blocking here
    /// blocks the worker.
    fn periodic_event(&self, memory: &mut ThreadMemory) {
        let _ = memory;
    }

    /// Called on client login.
    fn login_check(
        &self,
        memory: &mut ThreadMemory,
        username: &str,
        password: &str,
        user_properties: Option<&[UserProperty]>,
    ) -> AuthResult;

    /// Called on publish, deliver and subscribe.
    fn acl_check(
        &self,
        memory: &mut ThreadMemory,
        access: AclAccess,
        client_id: &str,
        username: &str,
        request: &AclRequest<'_>,
    ) -> AuthResult;

    /// MQTT 5 extended auth. `return_data` goes back to the client in an
    /// AUTH packet; `username` may be rewritten and then applies to ACL
    /// checks and logging. Optional.
    #[allow(clippy::too_many_arguments)]
    fn extended_auth(
        &self,
        memory: &mut ThreadMemory,
        client_id: &str,
        stage: ExtendedAuthStage,
        auth_method: &str,
        auth_data: &[u8],
        user_properties: Option<&[UserProperty]>,
        return_data: &mut Vec<u8>,
        username: &mut String,
    ) -> AuthResult {
        let _ = (
            memory,
            client_id,
            stage,
            auth_method,
            auth_data,
            user_properties,
            return_data,
            username,
        );
        AuthResult::AuthMethodNotSupported
    }
}

/// A plugin that allows everything. Used when the host supplies none.
#[derive(Debug, Default)]
pub struct AllowAllPlugin;

impl AuthPlugin for AllowAllPlugin {
    fn allocate_thread_memory(&self, _opts: &PluginOpts) -> Result<ThreadMemory> {
        Ok(Box::new(()))
    }

    fn deallocate_thread_memory(&self, _memory: ThreadMemory, _opts: &PluginOpts) {}

    fn init(&self, _memory: &mut ThreadMemory, _opts: &PluginOpts, _reloading: bool) -> Result<()> {
        Ok(())
    }

    fn deinit(
        &self,
        _memory: &mut ThreadMemory,
        _opts: &PluginOpts,
        _reloading: bool,
    ) -> Result<()> {
        Ok(())
    }

    fn login_check(
        &self,
        _memory: &mut ThreadMemory,
        _username: &str,
        _password: &str,
        _user_properties: Option<&[UserProperty]>,
    ) -> AuthResult {
        AuthResult::Success
    }

    fn acl_check(
        &self,
        _memory: &mut ThreadMemory,
        _access: AclAccess,
        _client_id: &str,
        _username: &str,
        _request: &AclRequest<'_>,
    ) -> AuthResult {
        AuthResult::Success
    }
}

// Process-wide serialization mutexes. `serialize_init` guards
// init/deinit for plugins with thread-unsafe initialization;
// `serialize_auth_checks` guards every login/ACL call, negating worker
// parallelism for the plugin.
static INIT_LOCK: Mutex<()> = Mutex::new(());
static AUTH_CHECK_LOCK: Mutex<()> = Mutex::new(());

/// Per-worker binding to the auth plugin.
pub struct PluginBinding {
    plugin: std::sync::Arc<dyn AuthPlugin>,
    memory: Option<ThreadMemory>,
    opts: PluginOpts,
    serialize_init: bool,
    serialize_auth_checks: bool,
    initialized: bool,
}

impl PluginBinding {
    /// Allocate the plugin's per-worker memory. Must run on the owning
    /// worker thread, before `init`.
    pub fn new(plugin: std::sync::Arc<dyn AuthPlugin>, settings: &PluginSettings) -> Result<Self> {
        let memory = plugin.allocate_thread_memory(&settings.options)?;
        Ok(Self {
            plugin,
            memory: Some(memory),
            opts: settings.options.clone(),
            serialize_init: settings.serialize_init,
            serialize_auth_checks: settings.serialize_auth_checks,
            initialized: false,
        })
    }

    /// Run `init`. A panic inside the plugin surfaces as `Error::Plugin`.
    pub fn init(&mut self, reloading: bool) -> Result<()> {
        let _guard = self.serialize_init.then(|| INIT_LOCK.lock());
        let plugin = self.plugin.clone();
        let opts = &self.opts;
        let memory = match self.memory.as_mut() {
            Some(m) => m,
            None => return Err(Error::Plugin("thread memory already released".into())),
        };
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| plugin.init(memory, opts, reloading)));
        match outcome {
            Ok(res) => {
                if res.is_ok() {
                    self.initialized = true;
                }
                res
            }
            Err(_) => Err(Error::Plugin("plugin panicked in init".into())),
        }
    }

    /// Run `deinit`. Errors are reported but do not block teardown.
    pub fn deinit(&mut self, reloading: bool) -> Result<()> {
        let _guard = self.serialize_init.then(|| INIT_LOCK.lock());
        let plugin = self.plugin.clone();
        let opts = &self.opts;
        let memory = match self.memory.as_mut() {
            Some(m) => m,
            None => return Err(Error::Plugin("thread memory already released".into())),
        };
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| plugin.deinit(memory, opts, reloading)));
        self.initialized = false;
        match outcome {
            Ok(res) => res,
            Err(_) => Err(Error::Plugin("plugin panicked in deinit".into())),
        }
    }

    /// Apply new plugin settings: `deinit(true)` then `init(true)`,
    /// without touching thread memory.
    pub fn reload(&mut self, settings: &PluginSettings) {
        if let Err(e) = self.deinit(true) {
            log::error!("plugin deinit during reload failed: {}", e);
        }
        self.opts = settings.options.clone();
        self.serialize_init = settings.serialize_init;
        self.serialize_auth_checks = settings.serialize_auth_checks;
        if let Err(e) = self.init(true) {
            log::error!("plugin init during reload failed: {}", e);
        }
    }

    /// Release the plugin's per-worker memory. Runs `deinit(false)` first
    /// if still initialized. Idempotent; also invoked from `Drop` so the
    /// deallocator is matched even on a fatal loop exit.
    pub fn teardown(&mut self) {
        if self.memory.is_none() {
            return;
        }
        if self.initialized {
            if let Err(e) = self.deinit(false) {
                log::error!("plugin deinit during teardown failed: {}", e);
            }
        }
        if let Some(memory) = self.memory.take() {
            let plugin = self.plugin.clone();
            let opts = &self.opts;
            if panic::catch_unwind(AssertUnwindSafe(|| {
                plugin.deallocate_thread_memory(memory, opts)
            }))
            .is_err()
            {
                log::error!("plugin panicked in deallocate_thread_memory");
            }
        }
    }

    pub fn periodic_event(&mut self) {
        let plugin = self.plugin.clone();
        let memory = match self.memory.as_mut() {
            Some(m) => m,
            None => return,
        };
        if panic::catch_unwind(AssertUnwindSafe(|| plugin.periodic_event(memory))).is_err() {
            log::error!("plugin panicked in periodic_event");
        }
    }

    /// Login check. A panic in the plugin becomes `Error`, and
    /// `AuthContinue` outside extended auth becomes `Error`.
    pub fn login_check(
        &mut self,
        username: &str,
        password: &str,
        user_properties: Option<&[UserProperty]>,
    ) -> AuthResult {
        let _guard = self.serialize_auth_checks.then(|| AUTH_CHECK_LOCK.lock());
        let plugin = self.plugin.clone();
        let memory = match self.memory.as_mut() {
            Some(m) => m,
            None => return AuthResult::Error,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            plugin.login_check(memory, username, password, user_properties)
        }));
        match outcome {
            Ok(AuthResult::AuthContinue) => {
                log::error!("plugin returned AuthContinue from login_check");
                AuthResult::Error
            }
            Ok(result) => result,
            Err(_) => {
                log::error!("plugin panicked in login_check for user '{}'", username);
                AuthResult::Error
            }
        }
    }

    /// ACL check. Splits the topic into subtopics for the plugin.
    pub fn acl_check(
        &mut self,
        access: AclAccess,
        client_id: &str,
        username: &str,
        topic: &str,
        qos: QoS,
        retain: bool,
        user_properties: Option<&[UserProperty]>,
    ) -> AuthResult {
        let _guard = self.serialize_auth_checks.then(|| AUTH_CHECK_LOCK.lock());
        let subtopics: Vec<String> = topic.split('/').map(str::to_string).collect();
        let request = AclRequest {
            topic,
            subtopics: &subtopics,
            qos,
            retain,
            user_properties,
        };
        let plugin = self.plugin.clone();
        let memory = match self.memory.as_mut() {
            Some(m) => m,
            None => return AuthResult::Error,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            plugin.acl_check(memory, access, client_id, username, &request)
        }));
        match outcome {
            Ok(AuthResult::AuthContinue) => {
                log::error!("plugin returned AuthContinue from acl_check");
                AuthResult::Error
            }
            Ok(result) => result,
            Err(_) => {
                log::error!(
                    "plugin panicked in acl_check for client '{}' topic '{}'",
                    client_id,
                    topic
                );
                AuthResult::Error
            }
        }
    }

    /// Extended auth step. `AuthContinue` is a valid result here.
    #[allow(clippy::too_many_arguments)]
    pub fn extended_auth(
        &mut self,
        client_id: &str,
        stage: ExtendedAuthStage,
        auth_method: &str,
        auth_data: &[u8],
        user_properties: Option<&[UserProperty]>,
        return_data: &mut Vec<u8>,
        username: &mut String,
    ) -> AuthResult {
        let plugin = self.plugin.clone();
        let memory = match self.memory.as_mut() {
            Some(m) => m,
            None => return AuthResult::Error,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            plugin.extended_auth(
                memory,
                client_id,
                stage,
                auth_method,
                auth_data,
                user_properties,
                return_data,
                username,
            )
        }));
        match outcome {
            Ok(result) => result,
            Err(_) => {
                log::error!("plugin panicked in extended_auth for client '{}'", client_id);
                AuthResult::Error
            }
        }
    }
}

impl Drop for PluginBinding {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts lifecycle calls; optionally panics in configured methods.
    #[derive(Default)]
    struct CountingPlugin {
        allocs: AtomicUsize,
        deallocs: AtomicUsize,
        inits: AtomicUsize,
        deinits: AtomicUsize,
        periodics: AtomicUsize,
        panic_in_login: bool,
        deny_logins: bool,
    }

    impl AuthPlugin for CountingPlugin {
        fn allocate_thread_memory(&self, _opts: &PluginOpts) -> Result<ThreadMemory> {
            self.allocs.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(0u64))
        }

        fn deallocate_thread_memory(&self, _memory: ThreadMemory, _opts: &PluginOpts) {
            self.deallocs.fetch_add(1, Ordering::SeqCst);
        }

        fn init(
            &self,
            _memory: &mut ThreadMemory,
            _opts: &PluginOpts,
            _reloading: bool,
        ) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn deinit(
            &self,
            _memory: &mut ThreadMemory,
            _opts: &PluginOpts,
            _reloading: bool,
        ) -> Result<()> {
            self.deinits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn periodic_event(&self, _memory: &mut ThreadMemory) {
            self.periodics.fetch_add(1, Ordering::SeqCst);
        }

        fn login_check(
            &self,
            memory: &mut ThreadMemory,
            _username: &str,
            _password: &str,
            _user_properties: Option<&[UserProperty]>,
        ) -> AuthResult {
            if self.panic_in_login {
                panic!("plugin exploded");
            }
            // Exercise the opaque memory to prove it round-trips.
            if let Some(count) = memory.downcast_mut::<u64>() {
                *count += 1;
            }
            if self.deny_logins {
                AuthResult::LoginDenied
            } else {
                AuthResult::Success
            }
        }

        fn acl_check(
            &self,
            _memory: &mut ThreadMemory,
            access: AclAccess,
            _client_id: &str,
            _username: &str,
            request: &AclRequest<'_>,
        ) -> AuthResult {
            if access == AclAccess::Subscribe && request.topic.starts_with('#') {
                AuthResult::AclDenied
            } else {
                AuthResult::Success
            }
        }
    }

    fn binding(plugin: Arc<CountingPlugin>) -> PluginBinding {
        PluginBinding::new(plugin, &PluginSettings::default()).unwrap()
    }

    #[test]
    fn test_allocate_init_deinit_deallocate_once() {
        let plugin = Arc::new(CountingPlugin::default());
        let mut b = binding(plugin.clone());
        b.init(false).unwrap();
        b.teardown();
        // Teardown again must be a no-op.
        b.teardown();
        drop(b);

        assert_eq!(plugin.allocs.load(Ordering::SeqCst), 1);
        assert_eq!(plugin.inits.load(Ordering::SeqCst), 1);
        assert_eq!(plugin.deinits.load(Ordering::SeqCst), 1);
        assert_eq!(plugin.deallocs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_matches_deallocate_without_explicit_teardown() {
        let plugin = Arc::new(CountingPlugin::default());
        let mut b = binding(plugin.clone());
        b.init(false).unwrap();
        drop(b);
        assert_eq!(plugin.deinits.load(Ordering::SeqCst), 1);
        assert_eq!(plugin.deallocs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reload_reinitializes_without_reallocating() {
        let plugin = Arc::new(CountingPlugin::default());
        let mut b = binding(plugin.clone());
        b.init(false).unwrap();
        b.reload(&PluginSettings::default());
        assert_eq!(plugin.allocs.load(Ordering::SeqCst), 1);
        assert_eq!(plugin.inits.load(Ordering::SeqCst), 2);
        assert_eq!(plugin.deinits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_login_panic_maps_to_error() {
        let plugin = Arc::new(CountingPlugin {
            panic_in_login: true,
            ..Default::default()
        });
        let mut b = binding(plugin);
        b.init(false).unwrap();
        assert_eq!(b.login_check("user", "pass", None), AuthResult::Error);
    }

    #[test]
    fn test_login_denied_passes_through() {
        let plugin = Arc::new(CountingPlugin {
            deny_logins: true,
            ..Default::default()
        });
        let mut b = binding(plugin);
        b.init(false).unwrap();
        assert_eq!(b.login_check("user", "pass", None), AuthResult::LoginDenied);
    }

    #[test]
    fn test_thread_memory_round_trips() {
        let plugin = Arc::new(CountingPlugin::default());
        let mut b = binding(plugin);
        b.init(false).unwrap();
        b.login_check("a", "b", None);
        b.login_check("a", "b", None);
        let memory = b.memory.as_ref().unwrap();
        assert_eq!(*memory.downcast_ref::<u64>().unwrap(), 2);
    }

    #[test]
    fn test_acl_subtopics_and_denial() {
        let plugin = Arc::new(CountingPlugin::default());
        let mut b = binding(plugin);
        b.init(false).unwrap();
        let allowed = b.acl_check(
            AclAccess::Write,
            "client-1",
            "user",
            "a/b/c",
            QoS::AtLeastOnce,
            false,
            None,
        );
        assert_eq!(allowed, AuthResult::Success);
        let denied = b.acl_check(
            AclAccess::Subscribe,
            "client-1",
            "user",
            "#",
            QoS::AtMostOnce,
            false,
            None,
        );
        assert_eq!(denied, AuthResult::AclDenied);
    }

    #[test]
    fn test_periodic_event_reaches_plugin() {
        let plugin = Arc::new(CountingPlugin::default());
        let mut b = binding(plugin.clone());
        b.init(false).unwrap();
        b.periodic_event();
        b.periodic_event();
        assert_eq!(plugin.periodics.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_extended_auth_default_unsupported() {
        let plugin = Arc::new(CountingPlugin::default());
        let mut b = binding(plugin);
        b.init(false).unwrap();
        let mut return_data = Vec::new();
        let mut username = String::new();
        let result = b.extended_auth(
            "client-1",
            ExtendedAuthStage::Auth,
            "SCRAM-SHA-1",
            b"data",
            None,
            &mut return_data,
            &mut username,
        );
        assert_eq!(result, AuthResult::AuthMethodNotSupported);
    }
}
