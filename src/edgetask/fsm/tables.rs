/*
 * Copyright (C) 2024 The Edgetask Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use super::{
    Action, FsmSpec, Rule, TaskState, EVENT_BACKUP, EVENT_CHECK, EVENT_CONFIG_UPDATE, EVENT_INIT,
    EVENT_PULL, EVENT_ROLLBACK, EVENT_TIMEOUT, EVENT_UPGRADE,
};

const fn rule(from: TaskState, event: &'static str, action: Action, to: TaskState) -> Rule {
    Rule {
        from: Some(from),
        event,
        action,
        to,
    }
}

const fn any(event: &'static str, action: Action, to: TaskState) -> Rule {
    Rule {
        from: None,
        event,
        action,
        to,
    }
}

use Action::{Failure, Success};
use TaskState::{
    BackingUp, Checking, Failed, Init, Pulling, RollingBack, Successful, Updating, Upgrading,
};

static UPGRADE_RULES: [Rule; 16] = [
    rule(Init, EVENT_INIT, Success, Checking),
    rule(Init, EVENT_INIT, Failure, Failed),
    rule(Init, EVENT_TIMEOUT, Failure, Failed),
    rule(Init, EVENT_UPGRADE, Success, Successful),
    rule(Checking, EVENT_CHECK, Success, BackingUp),
    rule(Checking, EVENT_CHECK, Failure, Failed),
    rule(Checking, EVENT_TIMEOUT, Failure, Failed),
    rule(BackingUp, EVENT_BACKUP, Success, Upgrading),
    rule(BackingUp, EVENT_BACKUP, Failure, Failed),
    rule(BackingUp, EVENT_TIMEOUT, Failure, Failed),
    rule(Upgrading, EVENT_UPGRADE, Success, Successful),
    rule(Upgrading, EVENT_UPGRADE, Failure, RollingBack),
    rule(Upgrading, EVENT_TIMEOUT, Failure, RollingBack),
    rule(RollingBack, EVENT_ROLLBACK, Success, Failed),
    rule(RollingBack, EVENT_ROLLBACK, Failure, Failed),
    rule(RollingBack, EVENT_TIMEOUT, Failure, Failed),
];

static UPGRADE_STAGES: [(TaskState, TaskState); 4] = [
    (Init, Checking),
    (Checking, BackingUp),
    (BackingUp, Upgrading),
    (Upgrading, RollingBack),
];

pub static UPGRADE_FSM: FsmSpec = FsmSpec {
    kind: "upgrade",
    rules: &UPGRADE_RULES,
    stages: &UPGRADE_STAGES,
};

static PREPULL_RULES: [Rule; 6] = [
    rule(Init, EVENT_INIT, Success, Checking),
    rule(Checking, EVENT_CHECK, Success, Pulling),
    rule(Checking, EVENT_CHECK, Failure, Failed),
    rule(Pulling, EVENT_PULL, Success, Successful),
    rule(Pulling, EVENT_PULL, Failure, Failed),
    any(EVENT_TIMEOUT, Failure, Failed),
];

static PREPULL_STAGES: [(TaskState, TaskState); 2] = [(Init, Checking), (Checking, Pulling)];

pub static PREPULL_FSM: FsmSpec = FsmSpec {
    kind: "prepull",
    rules: &PREPULL_RULES,
    stages: &PREPULL_STAGES,
};

static CONFIG_UPDATE_RULES: [Rule; 16] = [
    rule(Init, EVENT_INIT, Success, Checking),
    rule(Init, EVENT_INIT, Failure, Failed),
    rule(Init, EVENT_TIMEOUT, Failure, Failed),
    rule(Init, EVENT_CONFIG_UPDATE, Success, Successful),
    rule(Checking, EVENT_CHECK, Success, BackingUp),
    rule(Checking, EVENT_CHECK, Failure, Failed),
    rule(Checking, EVENT_TIMEOUT, Failure, Failed),
    rule(BackingUp, EVENT_BACKUP, Success, Updating),
    rule(BackingUp, EVENT_BACKUP, Failure, Failed),
    rule(BackingUp, EVENT_TIMEOUT, Failure, Failed),
    rule(Updating, EVENT_CONFIG_UPDATE, Success, Successful),
    rule(Updating, EVENT_CONFIG_UPDATE, Failure, RollingBack),
    rule(Updating, EVENT_TIMEOUT, Failure, RollingBack),
    rule(RollingBack, EVENT_ROLLBACK, Success, Failed),
    rule(RollingBack, EVENT_ROLLBACK, Failure, Failed),
    rule(RollingBack, EVENT_TIMEOUT, Failure, Failed),
];

static CONFIG_UPDATE_STAGES: [(TaskState, TaskState); 4] = [
    (Init, Checking),
    (Checking, BackingUp),
    (BackingUp, Updating),
    (Updating, RollingBack),
];

pub static CONFIG_UPDATE_FSM: FsmSpec = FsmSpec {
    kind: "configupdate",
    rules: &CONFIG_UPDATE_RULES,
    stages: &CONFIG_UPDATE_STAGES,
};
