/// One evaluation routine of the dispatcher, listed in priority order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisMode {
    /// Test-set loss and top-1/top-5 accuracy.
    Evaluate,
    /// Reconstruction error of encode followed by inverse.
    EvalInvertibility,
    /// Fused target images from inverted mean latents.
    SampleImages,
    /// Classification from latents recovered through a trained fusion net.
    EvalFusionNet,
    EvalSensitivity,
    /// Inversion error on one class of the training set.
    TestInverse,
    PlotTsne,
    TraceEstimation,
    SpectralNorm,
    Interpolate,
}

impl AnalysisMode {
    pub const PRIORITY: [AnalysisMode; 10] = [
        AnalysisMode::Evaluate,
        AnalysisMode::EvalInvertibility,
        AnalysisMode::SampleImages,
        AnalysisMode::EvalFusionNet,
        AnalysisMode::EvalSensitivity,
        AnalysisMode::TestInverse,
        AnalysisMode::PlotTsne,
        AnalysisMode::TraceEstimation,
        AnalysisMode::SpectralNorm,
        AnalysisMode::Interpolate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AnalysisMode::Evaluate => "evaluate",
            AnalysisMode::EvalInvertibility => "eval-invertibility",
            AnalysisMode::SampleImages => "sample-images",
            AnalysisMode::EvalFusionNet => "eval-fusion-net",
            AnalysisMode::EvalSensitivity => "eval-sensitivity",
            AnalysisMode::TestInverse => "test-inverse",
            AnalysisMode::PlotTsne => "plot-tsne",
            AnalysisMode::TraceEstimation => "trace-estimation",
            AnalysisMode::SpectralNorm => "spectral-norm",
            AnalysisMode::Interpolate => "interpolate",
        }
    }
}

impl std::fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Boolean switches, one per mode, as older configuration files spell them.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AnalysisFlags {
    pub evaluate: bool,
    pub eval_inv: bool,
    pub sample_img: bool,
    pub eval_funet: bool,
    pub eval_sen: bool,
    pub test_inv: bool,
    pub plot_tsne: bool,
    pub analysis_trace_est: bool,
    pub norm: bool,
    pub interpolate: bool,
}

impl AnalysisFlags {
    pub fn is_set(&self, mode: AnalysisMode) -> bool {
        match mode {
            AnalysisMode::Evaluate => self.evaluate,
            AnalysisMode::EvalInvertibility => self.eval_inv,
            AnalysisMode::SampleImages => self.sample_img,
            AnalysisMode::EvalFusionNet => self.eval_funet,
            AnalysisMode::EvalSensitivity => self.eval_sen,
            AnalysisMode::TestInverse => self.test_inv,
            AnalysisMode::PlotTsne => self.plot_tsne,
            AnalysisMode::TraceEstimation => self.analysis_trace_est,
            AnalysisMode::SpectralNorm => self.norm,
            AnalysisMode::Interpolate => self.interpolate,
        }
    }

    /// Modes whose flag is set, in priority order.
    pub fn set_modes(&self) -> Vec<AnalysisMode> {
        AnalysisMode::PRIORITY
            .into_iter()
            .filter(|&m| self.is_set(m))
            .collect()
    }
}

/// Pick the mode to run: an explicit mode wins, otherwise the first set flag
/// in priority order. Ignored flags are reported as warnings.
pub fn resolve_mode(explicit: Option<AnalysisMode>, flags: &AnalysisFlags) -> Option<AnalysisMode> {
    let set = flags.set_modes();
    let chosen = explicit.or_else(|| set.first().copied());
    if let Some(mode) = chosen {
        let ignored: Vec<&str> = set
            .iter()
            .filter(|&&m| m != mode)
            .map(|m| m.name())
            .collect();
        if !ignored.is_empty() {
            tracing::warn!(
                chosen = mode.name(),
                ignored = ?ignored,
                "several analysis modes requested; running only one"
            );
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::ValueEnum;

    #[test]
    fn test_no_flags_no_mode() {
        assert_eq!(resolve_mode(None, &AnalysisFlags::default()), None);
    }

    #[test]
    fn test_first_flag_in_priority_wins() {
        let flags = AnalysisFlags {
            norm: true,
            test_inv: true,
            interpolate: true,
            ..Default::default()
        };
        assert_eq!(resolve_mode(None, &flags), Some(AnalysisMode::TestInverse));
        assert_eq!(
            flags.set_modes(),
            vec![
                AnalysisMode::TestInverse,
                AnalysisMode::SpectralNorm,
                AnalysisMode::Interpolate
            ]
        );
    }

    #[test]
    fn test_explicit_mode_overrides_flags() {
        let flags = AnalysisFlags {
            evaluate: true,
            ..Default::default()
        };
        assert_eq!(
            resolve_mode(Some(AnalysisMode::PlotTsne), &flags),
            Some(AnalysisMode::PlotTsne)
        );
    }

    #[test]
    fn test_every_mode_has_a_flag() {
        for mode in AnalysisMode::PRIORITY {
            let mut flags = AnalysisFlags::default();
            assert!(!flags.is_set(mode));
            match mode {
                AnalysisMode::Evaluate => flags.evaluate = true,
                AnalysisMode::EvalInvertibility => flags.eval_inv = true,
                AnalysisMode::SampleImages => flags.sample_img = true,
                AnalysisMode::EvalFusionNet => flags.eval_funet = true,
                AnalysisMode::EvalSensitivity => flags.eval_sen = true,
                AnalysisMode::TestInverse => flags.test_inv = true,
                AnalysisMode::PlotTsne => flags.plot_tsne = true,
                AnalysisMode::TraceEstimation => flags.analysis_trace_est = true,
                AnalysisMode::SpectralNorm => flags.norm = true,
                AnalysisMode::Interpolate => flags.interpolate = true,
            }
            assert_eq!(resolve_mode(None, &flags), Some(mode));
        }
    }

    #[test]
    fn test_names_match_cli_and_serde() {
        for mode in AnalysisMode::PRIORITY {
            let value = mode.to_possible_value().unwrap();
            assert_eq!(value.get_name(), mode.name());
            let json = serde_json::to_string(&mode).unwrap();
            assert_eq!(json, format!("\"{}\"", mode.name()));
        }
    }
}
