//! Sonde kernel
//!
//! Shared vocabulary for the probe-module runtime:
//! - The [`ProbeModule`] trait and its lifecycle hooks
//! - Module metadata, launch modes and info snapshots
//! - The typed [`ModuleError`] taxonomy
//! - The event model and the listener activation table
//! - Type matchers and the instrumentation-layer collaborator contracts
//! - Resource declaration and injection types

pub mod config;
pub mod event;
pub mod instrument;
pub mod matcher;
pub mod module;
pub mod resource;

pub use config::{ConfigView, CoreConfig};
pub use event::{
    EventKind, EventListener, EventMonitor, EventPoolInfo, ListenerId, ListenerIdTable,
    ListenerTable, ProbeEvent, WatchId,
};
pub use instrument::{Instrumentation, LoadedType, TypeSource, TypeTransformer};
pub use matcher::{AnyMatcher, NameMatcher, PrefixMatcher, TypeMatcher, WildcardMatcher};
pub use module::{
    HookResult, LaunchMode, MODULE_API_VERSION, ModuleError, ModuleInfo, ModuleMetadata,
    ModuleResult, ProbeModule,
};
pub use resource::{
    EventWatcher, ModuleController, ModuleManagerApi, ModuleResources, ReleasableResource,
    ResourceKind, ResourceTracker,
};

/// Macro to export the modules declared by a dynamic-library archive.
///
/// The runtime resolves the generated symbols when it opens the library:
/// `_sonde_api_version` for compatibility checking and `_sonde_modules` for
/// module discovery. One archive may declare any number of modules.
///
/// ```rust,ignore
/// sonde_kernel::declare_modules!(MyProbe::new(), OtherProbe::default());
/// ```
#[macro_export]
macro_rules! declare_modules {
    ($($module:expr),+ $(,)?) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _sonde_api_version() -> u32 {
            $crate::module::MODULE_API_VERSION
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _sonde_modules()
        -> *mut ::std::vec::Vec<::std::boxed::Box<dyn $crate::module::ProbeModule>> {
            let modules: ::std::vec::Vec<::std::boxed::Box<dyn $crate::module::ProbeModule>> =
                ::std::vec![$(::std::boxed::Box::new($module)),+];
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(modules))
        }
    };
}
