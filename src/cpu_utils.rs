use crate::logger;
use core_affinity;
use num_cpus;

/// Picks the logical core that runs the test sequence.
/// Without a request the last core is used, away from core 0 where
/// interrupt handling usually lands.
pub fn control_core(requested_core: Option<usize>) -> usize {
    select_core(requested_core, num_cpus::get())
}

fn select_core(requested_core: Option<usize>, total_cores: usize) -> usize {
    let last_core = total_cores.saturating_sub(1);

    logger::log_debug(&format!("Total cores: {}", total_cores));

    match requested_core {
        Some(core) if core < total_cores => core,
        Some(core) => {
            logger::log_warn(&format!(
                "Requested control core {} does not exist ({} cores), using core {}",
                core, total_cores, last_core
            ));
            last_core
        }
        None => last_core,
    }
}

// ================================================================================================
// Thread Affinity
// ================================================================================================

/// Binds the current thread to a specific logical core.
///
/// # Arguments
/// * `core_id`: The logical core ID to bind to.
///
/// # Returns
/// `true` on success, `false` on failure.
pub fn bind_thread_to_core(core_id: usize) -> bool {
    if let Some(core_ids) = core_affinity::get_core_ids() {
        if let Some(core) = core_ids.into_iter().find(|c| c.id == core_id) {
            return core_affinity::set_for_current(core);
        }
    }
    false
}
