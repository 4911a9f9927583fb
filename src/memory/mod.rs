pub(crate) mod allocator;
pub(crate) mod block;
pub(crate) mod context;
pub(crate) mod group;
pub(crate) mod huge;
pub(crate) mod integration;
pub(crate) mod large_group;
pub(crate) mod list;
pub(crate) mod loom_tests;
pub(crate) mod object_pool;
pub(crate) mod page_source;
pub(crate) mod reaper;
pub(crate) mod size_class;
pub(crate) mod spin;
pub(crate) mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
