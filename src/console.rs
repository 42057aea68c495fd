//! Line-oriented control surface, normally fed from stdin.
//!
//! Each line is one command, for example `save raw`, `awb on`, `gamma 0.45`,
//! `mode 2` or `bayer rg`. Datatype and bayer values accept the numeric
//! control codes as well as names.

use std::io::BufRead;
use std::str::FromStr;

use tracing::{info, warn};

use crate::capture::CancellationToken;
use crate::control::{BayerPattern, SharedControls};
use crate::decode::SampleFormat;
use crate::error::{CameraError, Result};

/// Help text printed by the `help` command.
pub const HELP: &str = "commands: save still | save raw | awb on|off | abc on|off | \
gamma <value> | mode 1|2|3|raw10|raw12|yuv422 | bayer 1|2|3|4|bg|gb|rg|gr | quit";

/// One parsed console command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    /// Save the next decoded frame as a bitmap.
    SaveStill,
    /// Save the next raw buffer.
    SaveRaw,
    /// Toggle software white balance.
    WhiteBalance(bool),
    /// Toggle auto brightness/contrast.
    AutoContrast(bool),
    /// Set the gamma exponent.
    Gamma(f32),
    /// Select the sensor sample format.
    Mode(SampleFormat),
    /// Select the bayer pattern.
    Bayer(BayerPattern),
    /// Print the command list.
    Help,
    /// Stop capturing.
    Quit,
}

impl FromStr for ControlCommand {
    type Err = CameraError;

    fn from_str(line: &str) -> Result<Self> {
        let lowered = line.trim().to_ascii_lowercase();
        let words: Vec<&str> = lowered.split_whitespace().collect();
        let invalid = || CameraError::InvalidControl(format!("unknown command {:?}", line.trim()));

        match words.as_slice() {
            ["save", "still" | "bmp"] | ["still"] => Ok(Self::SaveStill),
            ["save", "raw"] | ["raw"] => Ok(Self::SaveRaw),
            ["awb", state] => parse_switch(state).map(Self::WhiteBalance),
            ["abc", state] => parse_switch(state).map(Self::AutoContrast),
            ["gamma", value] => value
                .parse::<f32>()
                .map(Self::Gamma)
                .map_err(|_| CameraError::InvalidControl(format!("bad gamma {value:?}"))),
            ["mode", value] => value.parse().map(Self::Mode),
            ["bayer", value] => value.parse().map(Self::Bayer),
            ["help" | "?"] => Ok(Self::Help),
            ["quit" | "exit" | "q"] => Ok(Self::Quit),
            _ => Err(invalid()),
        }
    }
}

fn parse_switch(state: &str) -> Result<bool> {
    match state {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        _ => Err(CameraError::InvalidControl(format!(
            "expected on or off, got {state:?}"
        ))),
    }
}

impl ControlCommand {
    /// Apply the command to the shared controls. `Quit` cancels `token`.
    pub fn apply(self, controls: &SharedControls, token: &CancellationToken) -> Result<()> {
        match self {
            Self::SaveStill => controls.request_save_still(),
            Self::SaveRaw => controls.request_save_raw(),
            Self::WhiteBalance(enabled) => controls.set_white_balance_enabled(enabled),
            Self::AutoContrast(enabled) => controls.set_auto_contrast_enabled(enabled),
            Self::Gamma(gamma) => controls.set_gamma(gamma)?,
            Self::Mode(format) => controls.set_bit_shift_mode(format),
            Self::Bayer(pattern) => controls.set_bayer_pattern(pattern),
            Self::Help => info!("{HELP}"),
            Self::Quit => token.cancel(),
        }
        Ok(())
    }
}

/// Read commands until `quit`, end of input or cancellation.
///
/// Bad commands are logged and skipped. Read errors end the console.
pub fn run_console<R: BufRead>(
    reader: R,
    controls: &SharedControls,
    token: &CancellationToken,
) -> Result<()> {
    for line in reader.lines() {
        if token.is_cancelled() {
            break;
        }
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<ControlCommand>() {
            Ok(command) => {
                if let Err(err) = command.apply(controls, token) {
                    warn!("{err}");
                    continue;
                }
                info!("applied {command:?}");
                if command == ControlCommand::Quit {
                    break;
                }
            }
            Err(err) => warn!("{err}"),
        }
    }
    Ok(())
}
