// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

//! Admission control for execution starts. A sliding window per
//! (user, trigger category, sync/async); advancement of an already
//! started run is never rate limited.

use crate::context::TriggerType;
use chrono::{DateTime, Duration, Utc};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Team,
    Enterprise,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    pub fn retry_after_seconds(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now).num_seconds().max(0) as u64
    }
}

/// Executions per window. API-category triggers draw from separate
/// quotas, and async admissions are wider than sync ones.
fn window_limit(plan: Plan, trigger: TriggerType, is_async: bool) -> u32 {
    let api = trigger.is_api_category();
    match (plan, api, is_async) {
        (Plan::Free, false, _) => 25,
        (Plan::Free, true, false) => 10,
        (Plan::Free, true, true) => 50,
        (Plan::Pro, false, _) => 200,
        (Plan::Pro, true, false) => 50,
        (Plan::Pro, true, true) => 200,
        (Plan::Team, false, _) => 500,
        (Plan::Team, true, false) => 100,
        (Plan::Team, true, true) => 500,
        (Plan::Enterprise, false, _) => 1000,
        (Plan::Enterprise, true, false) => 500,
        (Plan::Enterprise, true, true) => 1000,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    user_id: String,
    api_category: bool,
    is_async: bool,
}

pub struct RateLimiter {
    window: Duration,
    entries: Mutex<FxHashMap<WindowKey, VecDeque<DateTime<Utc>>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::seconds(60))
    }
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    /// Admit or refuse one execution start, consuming a slot on success.
    pub async fn check(
        &self,
        user_id: &str,
        plan: Plan,
        trigger: TriggerType,
        is_async: bool,
    ) -> RateLimitDecision {
        self.decide(user_id, plan, trigger, is_async, true).await
    }

    /// Report the current window without consuming a slot.
    pub async fn status(
        &self,
        user_id: &str,
        plan: Plan,
        trigger: TriggerType,
        is_async: bool,
    ) -> RateLimitDecision {
        self.decide(user_id, plan, trigger, is_async, false).await
    }

    async fn decide(
        &self,
        user_id: &str,
        plan: Plan,
        trigger: TriggerType,
        is_async: bool,
        consume: bool,
    ) -> RateLimitDecision {
        let now = Utc::now();
        let limit = window_limit(plan, trigger, is_async);
        let key = WindowKey {
            user_id: user_id.to_string(),
            api_category: trigger.is_api_category(),
            is_async,
        };

        let mut entries = self.entries.lock().await;
        let window = entries.entry(key).or_default();
        let floor = now - self.window;
        while window.front().is_some_and(|t| *t < floor) {
            window.pop_front();
        }

        let used = window.len() as u32;
        let allowed = used < limit;
        if allowed && consume {
            window.push_back(now);
        }

        let reset_at = window
            .front()
            .map_or(now + self.window, |oldest| *oldest + self.window);

        RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(used + u32::from(allowed && consume)),
            reset_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_until_the_window_fills() {
        let limiter = RateLimiter::default();
        let limit = window_limit(Plan::Free, TriggerType::Api, false);

        for i in 0..limit {
            let decision = limiter
                .check("user-1", Plan::Free, TriggerType::Api, false)
                .await;
            assert!(decision.allowed, "admission {i} should pass");
        }

        let decision = limiter
            .check("user-1", Plan::Free, TriggerType::Api, false)
            .await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.reset_at > Utc::now());
    }

    #[tokio::test]
    async fn api_and_ui_quotas_are_separate() {
        let limiter = RateLimiter::default();
        let api_limit = window_limit(Plan::Free, TriggerType::Api, false);
        for _ in 0..api_limit {
            limiter
                .check("user-1", Plan::Free, TriggerType::Api, false)
                .await;
        }
        assert!(
            !limiter
                .check("user-1", Plan::Free, TriggerType::Api, false)
                .await
                .allowed
        );
        assert!(
            limiter
                .check("user-1", Plan::Free, TriggerType::Manual, false)
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn webhook_and_schedule_share_the_api_category() {
        let limiter = RateLimiter::default();
        let api_limit = window_limit(Plan::Free, TriggerType::Api, false);
        for _ in 0..api_limit {
            limiter
                .check("user-1", Plan::Free, TriggerType::Webhook, false)
                .await;
        }
        assert!(
            !limiter
                .check("user-1", Plan::Free, TriggerType::Schedule, false)
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn users_do_not_share_windows() {
        let limiter = RateLimiter::default();
        let limit = window_limit(Plan::Free, TriggerType::Api, false);
        for _ in 0..limit {
            limiter
                .check("user-1", Plan::Free, TriggerType::Api, false)
                .await;
        }
        assert!(
            limiter
                .check("user-2", Plan::Free, TriggerType::Api, false)
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn status_does_not_consume() {
        let limiter = RateLimiter::default();
        let before = limiter
            .status("user-1", Plan::Pro, TriggerType::Manual, false)
            .await;
        let after = limiter
            .status("user-1", Plan::Pro, TriggerType::Manual, false)
            .await;
        assert_eq!(before.remaining, after.remaining);
    }
}
