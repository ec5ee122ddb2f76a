//! render.rs: document and chart rendering seams (external collaborators).

use anyhow::Result;

use crate::analytics::trend::TrendResult;
use crate::annex::AnnexTableResult;
use crate::context::ComputationContext;
use crate::sections::SectionResult;

/// Renders the PSUR document from the accumulated sections and annex tables.
pub trait DocxRenderer {
    fn render(
        &self,
        context: &ComputationContext,
        sections: &[SectionResult],
        tables: &[AnnexTableResult],
    ) -> Result<Vec<u8>>;
}

/// Renders the monthly complaint-rate control chart.
pub trait ChartRenderer {
    fn render_trend(&self, trend: &TrendResult) -> Result<Vec<u8>>;
}
