//! Plans for the trigger orchestrator
//!
//! Plans are declarative generators: they yield [`PlanCommand`] values and the
//! [`TriggerOrchestrator`](crate::orchestrator::TriggerOrchestrator) executes
//! them. A plan never touches hardware itself.
//!
//! # Plan Commands
//!
//! - `BeginRepetition` - start of one repetition (failure boundary)
//! - `Set` - external channel write
//! - `Wait` - settle or inter-repetition delay
//! - `ArmAndWait` - run one controller job and wait for it
//! - `TriggerAndRead` - `ArmAndWait`, then a datum and an event
//! - `WriteFile` - ask the file plugin to write the last frame
//!
//! # Dark-corrected count
//!
//! [`CountProtocol`] yields, per repetition:
//!
//! ```text
//! BeginRepetition(i)
//! Set FileName = <base>_<uuid>
//! Set PENumOffsetFrames, ImageMode = Average, Wait settle,      ┐ only when
//! Set FileWriteMode = Single, ArmAndWait PEAcquireOffset,       │ dark frames
//! WriteFile                                                     ┘ > 0
//! Set ImageMode = Average, AcquireTime, NumImages, Wait settle
//! Set FileWriteMode = Single, TriggerAndRead Acquire
//! WriteFile
//! Wait delay
//! ```

use daq_core::channel::ChannelValue;
use daq_core::error::{AppResult, DaqError};
use daq_core::experiment::new_uid;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Commands that plans yield for the orchestrator to execute
#[derive(Debug, Clone, PartialEq)]
pub enum PlanCommand {
    /// Start of a repetition (1-based)
    BeginRepetition {
        /// Repetition number
        index: usize,
    },
    /// External channel write
    Set {
        /// Prefix-relative channel name
        channel: String,
        /// Value to write
        value: ChannelValue,
    },
    /// Wait for a duration in seconds
    Wait {
        /// Duration in seconds
        seconds: f64,
    },
    /// Run one acquisition job on the controller owning `channel`
    ArmAndWait {
        /// Status channel
        channel: String,
    },
    /// Arm and wait, then reference the frame with a datum and emit an event
    TriggerAndRead {
        /// Status channel
        channel: String,
        /// Stream the event belongs to
        stream: String,
    },
    /// Write the last frame to disk
    WriteFile {
        /// Busy channel of the file plugin
        channel: String,
    },
}

/// Plan trait - all plans implement this to generate commands
pub trait Plan: Send + Sync {
    /// Plan type identifier (e.g., "pe_count")
    fn plan_type(&self) -> &str;

    /// Human-readable plan name
    fn plan_name(&self) -> &str;

    /// Plan arguments for documentation
    fn plan_args(&self) -> HashMap<String, String>;

    /// Number of repetitions the plan will run
    fn num_repetitions(&self) -> usize;

    /// Commands run once after staging, before the first repetition.
    ///
    /// `file_dir` is the staged artifact directory with a trailing separator.
    fn prepare(&self, _file_dir: &str) -> Vec<PlanCommand> {
        Vec::new()
    }

    /// Generate the next command, returning None when complete
    fn next_command(&mut self) -> Option<PlanCommand>;

    /// Reset the plan to start from the beginning
    fn reset(&mut self);
}

/// Channel names the count protocol writes, relative to the detector prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountChannels {
    /// Main exposure status channel
    pub acquire: String,
    /// Exposure per frame
    pub acquire_time: String,
    /// Frames per exposure
    pub num_images: String,
    /// Single, Multiple, Continuous or Average
    pub image_mode: String,
    /// Dark-frame correction status channel
    pub acquire_offset: String,
    /// Frames per correction pass
    pub num_offset_frames: String,
    /// File plugin name stem
    pub file_name: String,
    /// File plugin directory
    pub file_path: String,
    /// File plugin counter
    pub file_number: String,
    /// Single, Capture or Stream
    pub file_write_mode: String,
    /// File plugin write trigger
    pub write_file: String,
}

impl Default for CountChannels {
    fn default() -> Self {
        Self {
            acquire: "cam1:Acquire".to_string(),
            acquire_time: "cam1:AcquireTime".to_string(),
            num_images: "cam1:NumImages".to_string(),
            image_mode: "cam1:ImageMode".to_string(),
            acquire_offset: "cam1:PEAcquireOffset".to_string(),
            num_offset_frames: "cam1:PENumOffsetFrames".to_string(),
            file_name: "TIFF1:FileName".to_string(),
            file_path: "TIFF1:FilePath".to_string(),
            file_number: "TIFF1:FileNumber".to_string(),
            file_write_mode: "TIFF1:FileWriteMode".to_string(),
            write_file: "TIFF1:WriteFile".to_string(),
        }
    }
}

/// Parameters of a dark-corrected count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountSettings {
    /// Exposure per frame in seconds
    pub exposure: f64,
    /// Frames averaged per acquisition
    pub num_images: u32,
    /// Dark frames per correction pass (0 skips the pass)
    pub num_dark_images: u32,
    /// Repetitions of the whole sequence
    pub num_repetitions: u32,
    /// Seconds to wait after each repetition
    pub delay: f64,
    /// Seconds to wait after reconfiguring the camera
    pub settle_time: f64,
    /// File name stem; a unique suffix is appended per repetition
    pub file_name_base: String,
}

impl Default for CountSettings {
    fn default() -> Self {
        Self {
            exposure: 1.0,
            num_images: 1,
            num_dark_images: 1,
            num_repetitions: 5,
            delay: 60.0,
            settle_time: 0.5,
            file_name_base: "pe_count".to_string(),
        }
    }
}

/// Upper bound for any single exposure, settle or delay, in seconds (one day).
pub const MAX_STEP_SECONDS: f64 = 86_400.0;

impl CountSettings {
    /// Reject values the detector cannot run.
    pub fn validate(&self) -> AppResult<()> {
        let exposure = self.exposure;
        if !(exposure.is_finite() && exposure > 0.0 && exposure <= MAX_STEP_SECONDS) {
            return Err(DaqError::Configuration(format!(
                "exposure must be within (0, {}] s, got {}",
                MAX_STEP_SECONDS, self.exposure
            )));
        }
        if self.num_images == 0 {
            return Err(DaqError::Configuration("num_images must be at least 1".to_string()));
        }
        for (name, seconds) in [("delay", self.delay), ("settle_time", self.settle_time)] {
            if !(seconds.is_finite() && (0.0..=MAX_STEP_SECONDS).contains(&seconds)) {
                return Err(DaqError::Configuration(format!(
                    "{} must be within [0, {}] s, got {}",
                    name, MAX_STEP_SECONDS, seconds
                )));
            }
        }
        if self.file_name_base.is_empty() {
            return Err(DaqError::Configuration("file_name_base must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Dark-corrected repeated count for a Perkin-Elmer style detector.
#[derive(Debug, Clone)]
pub struct CountProtocol {
    settings: CountSettings,
    channels: CountChannels,

    // Execution state
    repetition: usize,
    current_step: CountStep,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CountStep {
    Begin,
    FileName,
    DarkFrames,
    DarkImageMode,
    DarkSettle,
    DarkWriteMode,
    DarkArm,
    DarkWrite,
    ImageMode,
    AcquireTime,
    NumImages,
    Settle,
    WriteMode,
    TriggerAndRead,
    Write,
    Delay,
}

const IMAGE_MODE_AVERAGE: &str = "Average";
const WRITE_MODE_SINGLE: &str = "Single";

impl CountProtocol {
    /// Create a count plan after validating `settings`.
    pub fn new(settings: CountSettings) -> AppResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            channels: CountChannels::default(),
            repetition: 0,
            current_step: CountStep::Begin,
        })
    }

    /// Validated settings
    pub fn settings(&self) -> &CountSettings {
        &self.settings
    }

    /// Channel names written by the plan
    pub fn channels(&self) -> &CountChannels {
        &self.channels
    }

    fn set(channel: &str, value: impl Into<ChannelValue>) -> PlanCommand {
        PlanCommand::Set {
            channel: channel.to_string(),
            value: value.into(),
        }
    }

    fn settle_or(&mut self, next: CountStep) -> Option<PlanCommand> {
        if self.settings.settle_time > 0.0 {
            Some(PlanCommand::Wait {
                seconds: self.settings.settle_time,
            })
        } else {
            self.current_step = next;
            self.next_command()
        }
    }

    fn finish_repetition(&mut self) {
        self.repetition += 1;
        self.current_step = CountStep::Begin;
    }
}

impl Plan for CountProtocol {
    fn plan_type(&self) -> &str {
        "pe_count"
    }

    fn plan_name(&self) -> &str {
        "Dark-corrected Count"
    }

    fn plan_args(&self) -> HashMap<String, String> {
        let s = &self.settings;
        let mut args = HashMap::new();
        args.insert("exposure".to_string(), s.exposure.to_string());
        args.insert("num_images".to_string(), s.num_images.to_string());
        args.insert("num_dark_images".to_string(), s.num_dark_images.to_string());
        args.insert("num_repetitions".to_string(), s.num_repetitions.to_string());
        args.insert("delay".to_string(), s.delay.to_string());
        args.insert("file_name_base".to_string(), s.file_name_base.clone());
        args
    }

    fn num_repetitions(&self) -> usize {
        self.settings.num_repetitions as usize
    }

    fn prepare(&self, file_dir: &str) -> Vec<PlanCommand> {
        vec![
            Self::set(&self.channels.file_number, 1),
            Self::set(&self.channels.file_path, file_dir),
        ]
    }

    fn next_command(&mut self) -> Option<PlanCommand> {
        if self.repetition >= self.num_repetitions() {
            return None;
        }

        let ch = &self.channels;
        let cmd = match self.current_step {
            CountStep::Begin => {
                self.current_step = CountStep::FileName;
                PlanCommand::BeginRepetition {
                    index: self.repetition + 1,
                }
            }
            CountStep::FileName => {
                let name = format!("{}_{}", self.settings.file_name_base, new_uid());
                let cmd = Self::set(&ch.file_name, name);
                self.current_step = if self.settings.num_dark_images > 0 {
                    CountStep::DarkFrames
                } else {
                    CountStep::ImageMode
                };
                cmd
            }
            CountStep::DarkFrames => {
                let cmd = Self::set(&ch.num_offset_frames, i64::from(self.settings.num_dark_images));
                self.current_step = CountStep::DarkImageMode;
                cmd
            }
            CountStep::DarkImageMode => {
                let cmd = Self::set(&ch.image_mode, IMAGE_MODE_AVERAGE);
                self.current_step = CountStep::DarkSettle;
                cmd
            }
            CountStep::DarkSettle => {
                self.current_step = CountStep::DarkWriteMode;
                return self.settle_or(CountStep::DarkWriteMode);
            }
            CountStep::DarkWriteMode => {
                let cmd = Self::set(&ch.file_write_mode, WRITE_MODE_SINGLE);
                self.current_step = CountStep::DarkArm;
                cmd
            }
            CountStep::DarkArm => {
                let cmd = PlanCommand::ArmAndWait {
                    channel: ch.acquire_offset.clone(),
                };
                self.current_step = CountStep::DarkWrite;
                cmd
            }
            CountStep::DarkWrite => {
                let cmd = PlanCommand::WriteFile {
                    channel: ch.write_file.clone(),
                };
                self.current_step = CountStep::ImageMode;
                cmd
            }
            CountStep::ImageMode => {
                let cmd = Self::set(&ch.image_mode, IMAGE_MODE_AVERAGE);
                self.current_step = CountStep::AcquireTime;
                cmd
            }
            CountStep::AcquireTime => {
                let cmd = Self::set(&ch.acquire_time, self.settings.exposure);
                self.current_step = CountStep::NumImages;
                cmd
            }
            CountStep::NumImages => {
                let cmd = Self::set(&ch.num_images, i64::from(self.settings.num_images));
                self.current_step = CountStep::Settle;
                cmd
            }
            CountStep::Settle => {
                self.current_step = CountStep::WriteMode;
                return self.settle_or(CountStep::WriteMode);
            }
            CountStep::WriteMode => {
                let cmd = Self::set(&ch.file_write_mode, WRITE_MODE_SINGLE);
                self.current_step = CountStep::TriggerAndRead;
                cmd
            }
            CountStep::TriggerAndRead => {
                let cmd = PlanCommand::TriggerAndRead {
                    channel: ch.acquire.clone(),
                    stream: "primary".to_string(),
                };
                self.current_step = CountStep::Write;
                cmd
            }
            CountStep::Write => {
                let cmd = PlanCommand::WriteFile {
                    channel: ch.write_file.clone(),
                };
                if self.settings.delay > 0.0 {
                    self.current_step = CountStep::Delay;
                } else {
                    self.finish_repetition();
                }
                cmd
            }
            CountStep::Delay => {
                let seconds = self.settings.delay;
                self.finish_repetition();
                PlanCommand::Wait { seconds }
            }
        };

        Some(cmd)
    }

    fn reset(&mut self) {
        self.repetition = 0;
        self.current_step = CountStep::Begin;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CountSettings {
        CountSettings {
            exposure: 0.5,
            num_images: 2,
            num_dark_images: 3,
            num_repetitions: 2,
            delay: 5.0,
            settle_time: 0.5,
            file_name_base: "sample".to_string(),
        }
    }

    fn drain(plan: &mut CountProtocol) -> Vec<PlanCommand> {
        std::iter::from_fn(|| plan.next_command()).collect()
    }

    #[test]
    fn test_repetition_order_with_dark_frames() {
        let mut plan = CountProtocol::new(settings()).unwrap();
        let cmds = drain(&mut plan);

        // 16 commands per repetition
        assert_eq!(cmds.len(), 32);
        assert_eq!(cmds[0], PlanCommand::BeginRepetition { index: 1 });
        match &cmds[1] {
            PlanCommand::Set { channel, value } => {
                assert_eq!(channel, "TIFF1:FileName");
                assert!(value.as_str().unwrap().starts_with("sample_"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            cmds[2],
            PlanCommand::Set {
                channel: "cam1:PENumOffsetFrames".to_string(),
                value: ChannelValue::Int(3),
            }
        );
        assert_eq!(cmds[4], PlanCommand::Wait { seconds: 0.5 });
        assert_eq!(
            cmds[6],
            PlanCommand::ArmAndWait {
                channel: "cam1:PEAcquireOffset".to_string()
            }
        );
        assert!(matches!(cmds[7], PlanCommand::WriteFile { .. }));
        assert_eq!(
            cmds[9],
            PlanCommand::Set {
                channel: "cam1:AcquireTime".to_string(),
                value: ChannelValue::Float(0.5),
            }
        );
        assert!(matches!(cmds[13], PlanCommand::TriggerAndRead { .. }));
        assert!(matches!(cmds[14], PlanCommand::WriteFile { .. }));
        assert_eq!(cmds[15], PlanCommand::Wait { seconds: 5.0 });
        assert_eq!(cmds[16], PlanCommand::BeginRepetition { index: 2 });
    }

    #[test]
    fn test_no_dark_frames_no_delay_no_settle() {
        let mut plan = CountProtocol::new(CountSettings {
            num_dark_images: 0,
            delay: 0.0,
            settle_time: 0.0,
            num_repetitions: 1,
            ..settings()
        })
        .unwrap();
        let cmds = drain(&mut plan);

        assert_eq!(cmds.len(), 8);
        assert!(!cmds.iter().any(|c| matches!(c, PlanCommand::ArmAndWait { .. })));
        assert!(!cmds.iter().any(|c| matches!(c, PlanCommand::Wait { .. })));
        assert!(matches!(cmds.last(), Some(PlanCommand::WriteFile { .. })));
    }

    #[test]
    fn test_file_names_unique_per_repetition() {
        let mut plan = CountProtocol::new(settings()).unwrap();
        let names: Vec<String> = drain(&mut plan)
            .into_iter()
            .filter_map(|c| match c {
                PlanCommand::Set { channel, value } if channel == "TIFF1:FileName" => {
                    value.as_str().map(str::to_string)
                }
                _ => None,
            })
            .collect();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
    }

    #[test]
    fn test_prepare_resets_file_number_and_path() {
        let plan = CountProtocol::new(settings()).unwrap();
        assert_eq!(
            plan.prepare("/tmp/a/b/"),
            vec![
                PlanCommand::Set {
                    channel: "TIFF1:FileNumber".to_string(),
                    value: ChannelValue::Int(1),
                },
                PlanCommand::Set {
                    channel: "TIFF1:FilePath".to_string(),
                    value: ChannelValue::Str("/tmp/a/b/".to_string()),
                },
            ]
        );
    }

    #[test]
    fn test_plan_reset() {
        let mut plan = CountProtocol::new(CountSettings {
            num_repetitions: 1,
            ..settings()
        })
        .unwrap();
        let first = drain(&mut plan).len();
        assert!(plan.next_command().is_none());

        plan.reset();
        assert_eq!(drain(&mut plan).len(), first);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let bad = [
            CountSettings { exposure: 0.0, ..settings() },
            CountSettings { num_images: 0, ..settings() },
            CountSettings { delay: -1.0, ..settings() },
            CountSettings { settle_time: f64::NAN, ..settings() },
            CountSettings { delay: 1e20, ..settings() },
            CountSettings { exposure: 1e300, ..settings() },
            CountSettings { settle_time: f64::INFINITY, ..settings() },
            CountSettings { file_name_base: String::new(), ..settings() },
        ];
        for settings in bad {
            assert!(matches!(CountProtocol::new(settings), Err(DaqError::Configuration(_))));
        }
    }

    #[test]
    fn test_defaults() {
        let defaults = CountSettings::default();
        assert_eq!(defaults.num_repetitions, 5);
        assert_eq!(defaults.delay, 60.0);
        assert_eq!(defaults.settle_time, 0.5);
        let plan = CountProtocol::new(defaults).unwrap();
        assert_eq!(plan.num_repetitions(), 5);
        assert_eq!(plan.plan_args()["num_dark_images"], "1");
    }
}
