//! End-to-end scenarios driving the whole engine: mixed churn, cross-tier
//! traffic, cross-thread producer/consumer frees, stealing, the orphan
//! handoff, and huge-cache reuse.
