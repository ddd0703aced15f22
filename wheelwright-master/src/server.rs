// Copyright 2026 Wheelwright Maintainers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use wheelwright_common::tracing::init_tracing_with_default_env_filter;
use wheelwright_master::config::make_config_loader;
use wheelwright_master::{metrics, supervisor};

fn main() -> anyhow::Result<()> {
    if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);
        let _ = metrics::register_all();
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(supervisor::run(config))
    } else {
        Ok(())
    }
}
