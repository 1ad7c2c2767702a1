//! ---
//! mppt_section: "11-simulation-test-harness"
//! mppt_subsection: "module"
//! mppt_type: "source"
//! mppt_scope: "code"
//! mppt_description: "Simulation runtime helpers and scenario engines."
//! mppt_version: "v0.0.0-prealpha"
//! mppt_owner: "tbd"
//! ---
use std::f64::consts::PI;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};

/// One breakpoint of a recorded irradiance profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioStep {
    /// Seconds since scenario start.
    pub at_s: f64,
    /// Fraction of standard irradiance, 1.0 = 1000 W/m².
    pub irradiance: f64,
    #[serde(default)]
    pub ambient_c: Option<f64>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conditions {
    pub irradiance: f64,
    pub ambient_temperature: Option<f64>,
}

/// Piecewise-linear irradiance replay that wraps around at its end.
#[derive(Debug, Clone, Default)]
pub struct Scenario {
    steps: Vec<ScenarioStep>,
}

impl Scenario {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(path),
            Some("csv") => Self::from_csv(path),
            _ => bail!("unsupported scenario format: {}", path.display()),
        }
    }

    pub fn from_steps(mut steps: Vec<ScenarioStep>) -> Result<Self> {
        if steps.is_empty() {
            bail!("scenario has no steps");
        }
        if let Some(step) = steps
            .iter()
            .find(|step| !step.at_s.is_finite() || step.at_s < 0.0 || step.irradiance < 0.0)
        {
            bail!("invalid scenario step at {} s", step.at_s);
        }
        steps.sort_by(|a, b| a.at_s.total_cmp(&b.at_s));
        Ok(Self { steps })
    }

    fn from_json(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read scenario file {}", path.display()))?;
        let steps: Vec<ScenarioStep> = serde_json::from_str(&contents)
            .with_context(|| format!("invalid scenario JSON {}", path.display()))?;
        Self::from_steps(steps)
    }

    fn from_csv(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("unable to open scenario csv {}", path.display()))?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
        let mut steps = Vec::new();
        for row in reader.deserialize::<ScenarioStep>() {
            steps.push(row.with_context(|| format!("invalid scenario row in {}", path.display()))?);
        }
        Self::from_steps(steps)
    }

    pub fn steps(&self) -> &[ScenarioStep] {
        &self.steps
    }

    pub fn length(&self) -> Duration {
        self.steps
            .last()
            .map_or(Duration::ZERO, |step| Duration::from_secs_f64(step.at_s))
    }

    pub fn at(&self, elapsed: Duration) -> Conditions {
        let (Some(first), Some(last)) = (self.steps.first(), self.steps.last()) else {
            return Conditions {
                irradiance: 0.0,
                ambient_temperature: None,
            };
        };
        let mut t = elapsed.as_secs_f64();
        if last.at_s > 0.0 {
            t %= last.at_s;
        }
        if t <= first.at_s {
            return conditions(first);
        }
        for pair in self.steps.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if t <= b.at_s {
                let span = b.at_s - a.at_s;
                let w = if span > 0.0 { (t - a.at_s) / span } else { 1.0 };
                return Conditions {
                    irradiance: a.irradiance + (b.irradiance - a.irradiance) * w,
                    ambient_temperature: match (a.ambient_c, b.ambient_c) {
                        (Some(x), Some(y)) => Some(x + (y - x) * w),
                        (x, y) => y.or(x),
                    },
                };
            }
        }
        conditions(last)
    }
}

fn conditions(step: &ScenarioStep) -> Conditions {
    Conditions {
        irradiance: step.irradiance,
        ambient_temperature: step.ambient_c,
    }
}

/// Half-sine day between sunrise and sunset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunPosition {
    pub start_hour: f64,
    pub sunrise_hour: f64,
    pub sunset_hour: f64,
}

impl SunPosition {
    pub fn starting_at(start_hour: f64) -> Self {
        Self {
            start_hour,
            sunrise_hour: 6.0,
            sunset_hour: 20.0,
        }
    }

    pub fn at(&self, elapsed: Duration) -> Conditions {
        let hour = (self.start_hour + elapsed.as_secs_f64() / 3600.0) % 24.0;
        let day = self.sunset_hour - self.sunrise_hour;
        let irradiance = if hour > self.sunrise_hour && hour < self.sunset_hour {
            (PI * (hour - self.sunrise_hour) / day).sin()
        } else {
            0.0
        };
        Conditions {
            irradiance,
            ambient_temperature: Some(15.0 + 12.0 * irradiance),
        }
    }
}

#[derive(Debug, Clone)]
pub enum IrradianceProfile {
    Constant(f64),
    Diurnal(SunPosition),
    Scenario(Scenario),
}

impl IrradianceProfile {
    pub fn at(&self, elapsed: Duration) -> Conditions {
        match self {
            IrradianceProfile::Constant(irradiance) => Conditions {
                irradiance: *irradiance,
                ambient_temperature: None,
            },
            IrradianceProfile::Diurnal(sun) => sun.at(elapsed),
            IrradianceProfile::Scenario(scenario) => scenario.at(elapsed),
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            IrradianceProfile::Constant(_) => "constant",
            IrradianceProfile::Diurnal(_) => "diurnal",
            IrradianceProfile::Scenario(_) => "scenario",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write;

    #[test]
    fn loads_json_scenarios() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile()?;
        writeln!(
            file,
            "{}",
            r#"[{"at_s":0,"irradiance":0.0,"ambient_c":10.0},{"at_s":100,"irradiance":1.0,"ambient_c":30.0,"label":"noon"}]"#
        )?;
        file.flush()?;
        let path = file.into_temp_path();
        let scenario = Scenario::from_path(path.as_ref())?;
        let mid = scenario.at(Duration::from_secs(50));
        assert!((mid.irradiance - 0.5).abs() < 1e-9);
        assert_eq!(mid.ambient_temperature, Some(20.0));
        assert_eq!(scenario.length(), Duration::from_secs(100));
        path.close()?;
        Ok(())
    }

    #[test]
    fn loads_csv_scenarios() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile()?;
        writeln!(file, "at_s,irradiance,ambient_c,label")?;
        writeln!(file, "60,0.8,,cloud")?;
        writeln!(file, "0,0.2,,")?;
        file.flush()?;
        let path = file.into_temp_path();
        let scenario = Scenario::from_path(path.as_ref())?;
        assert_eq!(scenario.steps()[0].at_s, 0.0, "steps are sorted");
        let start = scenario.at(Duration::ZERO);
        assert_eq!(start.irradiance, 0.2);
        assert_eq!(start.ambient_temperature, None);
        path.close()?;
        Ok(())
    }

    #[test]
    fn scenario_wraps_around() {
        let scenario = Scenario::from_steps(vec![
            ScenarioStep {
                at_s: 0.0,
                irradiance: 0.0,
                ambient_c: None,
                label: None,
            },
            ScenarioStep {
                at_s: 10.0,
                irradiance: 1.0,
                ambient_c: None,
                label: None,
            },
        ])
        .unwrap();
        let early = scenario.at(Duration::from_secs(2)).irradiance;
        let wrapped = scenario.at(Duration::from_secs(12)).irradiance;
        assert!((early - wrapped).abs() < 1e-9);
    }

    #[test]
    fn rejects_unknown_extension_and_bad_steps() {
        assert!(Scenario::from_path(Path::new("profile.yaml")).is_err());
        assert!(Scenario::from_steps(Vec::new()).is_err());
    }

    #[test]
    fn sun_is_down_at_night() {
        let sun = SunPosition::starting_at(0.0);
        assert_eq!(sun.at(Duration::from_secs(3 * 3600)).irradiance, 0.0);
        let noon = sun.at(Duration::from_secs(13 * 3600)).irradiance;
        assert!((noon - 1.0).abs() < 1e-9);
    }
}
