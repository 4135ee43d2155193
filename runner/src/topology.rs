/// Static view of process-group membership, fixed for the lifetime of a run.
///
/// Pure data with no I/O. Only ranks for which `report_metrics()` is true
/// ever contribute metric lists to reduction; only ranks for which
/// `build_data_loader()` is true pull batches from a local data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankTopology {
    global_rank: usize,
    global_size: usize,
    data_parallel_rank: usize,
    data_parallel_world_size: usize,
    first_pipeline_stage: bool,
    last_pipeline_stage: bool,
    report_metrics: bool,
    build_data_loader: bool,
}

impl RankTopology {
    /// Plain data-parallel layout: every rank is its own pipeline, reports
    /// metrics, and builds a data loader.
    pub fn data_parallel(global_rank: usize, global_size: usize) -> Self {
        assert!(global_size > 0, "global_size must be > 0");
        assert!(global_rank < global_size, "global_rank out of range");

        Self {
            global_rank,
            global_size,
            data_parallel_rank: global_rank,
            data_parallel_world_size: global_size,
            first_pipeline_stage: true,
            last_pipeline_stage: true,
            report_metrics: true,
            build_data_loader: true,
        }
    }

    /// Pipeline-parallel layout: `data_parallel_rank` names the pipeline this
    /// rank resides in and `data_parallel_world_size` the number of
    /// pipelines. Only the last stage reports metrics; only terminal stages
    /// build data loaders. Intermediate stages exist solely to compute
    /// partial forward/backward work.
    pub fn pipeline(
        global_rank: usize,
        global_size: usize,
        data_parallel_rank: usize,
        data_parallel_world_size: usize,
        first_pipeline_stage: bool,
        last_pipeline_stage: bool,
    ) -> Self {
        assert!(global_size > 0, "global_size must be > 0");
        assert!(global_rank < global_size, "global_rank out of range");
        assert!(
            data_parallel_rank < data_parallel_world_size,
            "data_parallel_rank out of range"
        );

        Self {
            global_rank,
            global_size,
            data_parallel_rank,
            data_parallel_world_size,
            first_pipeline_stage,
            last_pipeline_stage,
            report_metrics: last_pipeline_stage,
            build_data_loader: first_pipeline_stage || last_pipeline_stage,
        }
    }

    #[inline]
    pub fn global_rank(&self) -> usize {
        self.global_rank
    }

    #[inline]
    pub fn global_size(&self) -> usize {
        self.global_size
    }

    #[inline]
    pub fn data_parallel_rank(&self) -> usize {
        self.data_parallel_rank
    }

    #[inline]
    pub fn data_parallel_world_size(&self) -> usize {
        self.data_parallel_world_size
    }

    #[inline]
    pub fn is_first_pipeline_stage(&self) -> bool {
        self.first_pipeline_stage
    }

    #[inline]
    pub fn is_last_pipeline_stage(&self) -> bool {
        self.last_pipeline_stage
    }

    #[inline]
    pub fn report_metrics(&self) -> bool {
        self.report_metrics
    }

    #[inline]
    pub fn build_data_loader(&self) -> bool {
        self.build_data_loader
    }

    #[inline]
    pub fn is_chief(&self) -> bool {
        self.global_rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_parallel_ranks_report_and_load() {
        let topo = RankTopology::data_parallel(2, 4);
        assert_eq!(topo.data_parallel_rank(), 2);
        assert_eq!(topo.data_parallel_world_size(), 4);
        assert!(topo.report_metrics());
        assert!(topo.build_data_loader());
        assert!(!topo.is_chief());
    }

    #[test]
    fn intermediate_pipeline_stage_neither_reports_nor_loads() {
        let topo = RankTopology::pipeline(1, 4, 0, 2, false, false);
        assert!(!topo.report_metrics());
        assert!(!topo.build_data_loader());
    }

    #[test]
    fn terminal_pipeline_stages() {
        let first = RankTopology::pipeline(0, 4, 0, 2, true, false);
        assert!(!first.report_metrics());
        assert!(first.build_data_loader());

        let last = RankTopology::pipeline(1, 4, 0, 2, false, true);
        assert!(last.report_metrics());
        assert!(last.build_data_loader());
    }
}
