// Copyright (c) The jjs-harness Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use color_eyre::Result;
use jjs_harness::JjsHarnessApp;

fn main() -> Result<()> {
    color_eyre::install()?;

    let app = JjsHarnessApp::parse();
    let output = app.init_output();

    match app.exec() {
        Ok(()) => Ok(()),
        Err(error) => {
            error.display_to_stderr(&output);
            std::process::exit(error.process_exit_code())
        }
    }
}
