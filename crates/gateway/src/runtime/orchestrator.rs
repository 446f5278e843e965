//! The conversation orchestrator.
//!
//! Two event kinds enter per conversation — user messages and timer
//! fires — and both run under the conversation's serial lane, so state
//! transitions never race. The orchestrator owns the event flow:
//! record inbound, cancel the ladder, classify, apply the decision,
//! dispatch, re-enrol, summarize. Once the inbound message is recorded,
//! failures never propagate back to the gateway; the user-visible
//! failure mode is silence plus an operator notification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use lf_domain::config::{Config, FollowupConfig, ReplyConfig};
use lf_domain::event::OperatorEvent;
use lf_domain::model::{
    Conversation, ConversationMode, ConversationPatch, DecisionAction, Integration, Lead,
    Message, ScheduledAction, Sender,
};
use lf_domain::Result;
use lf_pipeline::schema::truncate_chars;
use lf_pipeline::{stages, PipelineInput, Reasoner};
use lf_pipeline::rules::apply_stage_override;
use lf_pipeline::ClassifyOutput;
use lf_store::Store;

use crate::runtime::bus::OperatorBus;
use crate::runtime::context::build_context;
use crate::runtime::followups::enrol_ladder;
use crate::runtime::lane::ConversationLaneMap;
use crate::runtime::outbound::Transport;

/// A normalized inbound user message from the transport gateway.
#[derive(Debug, Clone)]
pub struct InboundUserMessage {
    pub phone_number_id: String,
    pub from_phone: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

pub struct Orchestrator {
    store: Arc<dyn Store>,
    reasoner: Arc<dyn Reasoner>,
    transport: Arc<dyn Transport>,
    bus: Arc<OperatorBus>,
    lanes: Arc<ConversationLaneMap>,
    followups: FollowupConfig,
    reply: ReplyConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        reasoner: Arc<dyn Reasoner>,
        transport: Arc<dyn Transport>,
        bus: Arc<OperatorBus>,
        lanes: Arc<ConversationLaneMap>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            reasoner,
            transport,
            bus,
            lanes,
            followups: config.followups.clone(),
            reply: config.reply.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // UserMessage
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Handle one inbound user message end to end.
    ///
    /// Errors only escape while nothing has been recorded yet (so the
    /// provider can redeliver); after the lead message is appended the
    /// turn degrades internally instead.
    pub async fn handle_user_message(&self, inbound: InboundUserMessage) -> Result<()> {
        let integration = self
            .store
            .resolve_integration(&inbound.phone_number_id)
            .await?;
        let lead = self
            .store
            .upsert_lead(
                integration.organization_id,
                &inbound.from_phone,
                &inbound.sender_name,
            )
            .await?;
        let (conversation, created) = self
            .store
            .get_or_create_conversation(integration.organization_id, lead.id, inbound.timestamp)
            .await?;
        if created {
            tracing::info!(
                conversation_id = %conversation.id,
                lead_phone = %lead.phone,
                "conversation created"
            );
        }

        let _lane = self.lanes.acquire(conversation.id).await;

        let message = self
            .store
            .append_message(conversation.id, Sender::Lead, &inbound.text, inbound.timestamp)
            .await?;

        // The inbound is now durable: from here failures stay local.
        if let Err(e) = self
            .run_user_turn(&integration, &lead, conversation.id, &message)
            .await
        {
            tracing::error!(
                conversation_id = %conversation.id,
                error = %e,
                "turn failed after inbound was recorded"
            );
        }
        Ok(())
    }

    async fn run_user_turn(
        &self,
        integration: &Integration,
        lead: &Lead,
        conversation_id: Uuid,
        message: &Message,
    ) -> Result<()> {
        let now = Utc::now();
        let conversation = self
            .store
            .update_conversation(
                conversation_id,
                &ConversationPatch {
                    last_user_message_at: Some(message.timestamp),
                    ..Default::default()
                },
                now,
            )
            .await?;

        self.bus.publish(OperatorEvent::MessageCreated {
            organization_id: integration.organization_id,
            conversation_id,
            message: message.clone(),
        });

        // Any prior ladder is obsolete the moment the user speaks.
        self.store.cancel_pending_actions(conversation_id).await?;

        if conversation.mode == ConversationMode::Human {
            tracing::debug!(conversation_id = %conversation_id, "human mode — bot muted");
            return Ok(());
        }

        let input = build_context(
            self.store.as_ref(),
            &self.reply,
            integration,
            &conversation,
            Utc::now(),
        )
        .await?;

        let classification = match self.reasoner.classify(&input).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "classify failed — applying safe fallback"
                );
                ClassifyOutput::fallback(conversation.stage)
            }
        };

        let final_stage = apply_stage_override(
            conversation.stage,
            classification.new_stage,
            Some(classification.new_stage),
            classification.confidence,
        );
        let wants_attention = classification.needs_human_attention
            || classification.high_risk_or_low_confidence()
            || matches!(
                classification.action,
                DecisionAction::FlagAttention | DecisionAction::HandoffHuman
            );

        // One coalesced patch — a failure here leaves no partial state.
        let mut conversation = self
            .store
            .update_conversation(
                conversation_id,
                &ConversationPatch {
                    stage: Some(final_stage),
                    intent_level: Some(classification.intent_level),
                    user_sentiment: Some(classification.user_sentiment),
                    needs_human_attention: Some(wants_attention),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await?;

        let mut bot_text: Option<String> = None;

        if conversation.needs_human_attention {
            self.raise_attention(&conversation, &classification.situation_summary);
        } else {
            let should_send = classification.should_respond
                && matches!(
                    classification.action,
                    DecisionAction::SendNow | DecisionAction::InitiateCta
                );
            if should_send {
                match self.reasoner.generate(&input, &classification).await {
                    Ok(draft) if draft.sendable() => {
                        match self
                            .dispatch(integration, lead, &conversation, &draft.message_text)
                            .await
                        {
                            Ok(updated) => {
                                conversation = updated;
                                bot_text = Some(draft.message_text);
                            }
                            Err(e) => {
                                // Outbound failed — no retry (it could
                                // double-send); hand the thread to a human.
                                tracing::warn!(
                                    conversation_id = %conversation_id,
                                    error = %e,
                                    "outbound send failed"
                                );
                                let conversation = self
                                    .flag_attention(conversation_id, "outbound delivery failed")
                                    .await?;
                                self.finish_turn(&input, &conversation, &message.text, None)
                                    .await;
                                return Ok(());
                            }
                        }
                    }
                    Ok(draft) => {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            violations = ?draft.violations,
                            "draft failed self-check — staying silent"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            error = %e,
                            "generate failed — staying silent"
                        );
                    }
                }
            }

            enrol_ladder(self.store.as_ref(), &self.followups, &conversation, Utc::now()).await?;
        }

        self.finish_turn(&input, &conversation, &message.text, bot_text.as_deref())
            .await;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // TimerFire
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Handle one claimed follow-up action. Never propagates errors and
    /// never enrols a new ladder — nudging is owned by user-message
    /// handling, which is what keeps it bounded.
    pub async fn handle_timer_fire(&self, action: ScheduledAction) {
        let _lane = self.lanes.acquire(action.conversation_id).await;

        let conversation = match self.store.get_conversation(action.conversation_id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(action_id = %action.id, error = %e, "follow-up without conversation");
                self.discard(action.id).await;
                return;
            }
        };

        if action.is_stale(conversation.last_user_message_at) {
            tracing::info!(
                action_id = %action.id,
                conversation_id = %conversation.id,
                "stale follow-up discarded — user spoke after scheduling"
            );
            self.discard(action.id).await;
            return;
        }
        if conversation.nudges_suppressed() {
            tracing::debug!(
                action_id = %action.id,
                conversation_id = %conversation.id,
                "follow-up suppressed"
            );
            self.discard(action.id).await;
            return;
        }

        if let Err(e) = self.run_timer_turn(&action, conversation).await {
            tracing::warn!(action_id = %action.id, error = %e, "follow-up turn failed");
        }
        self.discard(action.id).await;
    }

    async fn run_timer_turn(
        &self,
        action: &ScheduledAction,
        conversation: Conversation,
    ) -> Result<()> {
        let integration = self
            .store
            .integration_for_organization(conversation.organization_id)
            .await?;
        let lead = self.store.get_lead(conversation.lead_id).await?;

        let input = build_context(
            self.store.as_ref(),
            &self.reply,
            &integration,
            &conversation,
            Utc::now(),
        )
        .await?;

        let classification = match self.reasoner.classify(&input).await {
            Ok(c) => c,
            Err(e) => {
                // A follow-up is optional by nature: drop it silently.
                tracing::info!(
                    conversation_id = %conversation.id,
                    error = %e,
                    "classify failed on follow-up — consuming fire"
                );
                return Ok(());
            }
        };

        let mut conversation = conversation;
        let mut bot_text: Option<String> = None;

        let wants_send = classification.action == DecisionAction::SendNow
            && classification.should_respond
            && !classification.high_risk_or_low_confidence();

        if wants_send {
            if let Ok(draft) = self.reasoner.generate(&input, &classification).await {
                if draft.sendable() {
                    // The model ran for a while; re-read the conversation
                    // and abort if the user has spoken in the meantime.
                    let fresh = self.store.get_conversation(conversation.id).await?;
                    if action.is_stale(fresh.last_user_message_at) || fresh.nudges_suppressed() {
                        tracing::info!(
                            conversation_id = %conversation.id,
                            "nudge aborted — conversation moved while classifying"
                        );
                        return Ok(());
                    }

                    match self
                        .dispatch(&integration, &lead, &fresh, &draft.message_text)
                        .await
                    {
                        Ok(updated) => {
                            conversation = self
                                .store
                                .update_conversation(
                                    updated.id,
                                    &ConversationPatch {
                                        followup_count_24h: Some(updated.followup_count_24h + 1),
                                        total_nudges: Some(updated.total_nudges + 1),
                                        ..Default::default()
                                    },
                                    Utc::now(),
                                )
                                .await?;
                            bot_text = Some(draft.message_text);
                            tracing::info!(
                                conversation_id = %conversation.id,
                                reason = %action.context,
                                total_nudges = conversation.total_nudges,
                                "nudge dispatched"
                            );
                        }
                        Err(e) => {
                            tracing::warn!(
                                conversation_id = %conversation.id,
                                error = %e,
                                "nudge send failed"
                            );
                            let conversation = self
                                .flag_attention(conversation.id, "outbound delivery failed")
                                .await?;
                            self.finish_turn(&input, &conversation, "", None).await;
                            return Ok(());
                        }
                    }
                }
            }
        }

        let user_text = input.latest_user_text().unwrap_or("").to_owned();
        self.finish_turn(&input, &conversation, &user_text, bot_text.as_deref())
            .await;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Operator actions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Operator resolved the attention flag. Only this path clears it.
    pub async fn resolve_attention(&self, conversation_id: Uuid) -> Result<Conversation> {
        let _lane = self.lanes.acquire(conversation_id).await;
        let now = Utc::now();
        let conversation = self
            .store
            .update_conversation(
                conversation_id,
                &ConversationPatch {
                    resolve_attention: Some(now),
                    ..Default::default()
                },
                now,
            )
            .await?;
        self.bus.publish(OperatorEvent::AttentionResolved {
            organization_id: conversation.organization_id,
            conversation_id,
            resolved_at: now,
        });
        self.bus.publish(OperatorEvent::ConversationUpdated {
            organization_id: conversation.organization_id,
            conversation: conversation.clone(),
        });
        Ok(conversation)
    }

    /// Operator takeover / handback. Switching to `Human` cancels every
    /// pending nudge.
    pub async fn set_mode(
        &self,
        conversation_id: Uuid,
        mode: ConversationMode,
    ) -> Result<Conversation> {
        let _lane = self.lanes.acquire(conversation_id).await;
        let conversation = self
            .store
            .update_conversation(
                conversation_id,
                &ConversationPatch {
                    mode: Some(mode),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await?;
        if mode == ConversationMode::Human {
            self.store.cancel_pending_actions(conversation_id).await?;
        }
        self.bus.publish(OperatorEvent::ConversationUpdated {
            organization_id: conversation.organization_id,
            conversation: conversation.clone(),
        });
        Ok(conversation)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Shared steps
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Record the outbound message, send it, stamp `last_bot_message_at`.
    /// Recording happens first so the transcript never misses a message
    /// the provider may have delivered.
    async fn dispatch(
        &self,
        integration: &Integration,
        lead: &Lead,
        conversation: &Conversation,
        text: &str,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let message = self
            .store
            .append_message(conversation.id, Sender::Bot, text, now)
            .await?;

        self.transport.send(integration, &lead.phone, text).await?;

        let updated = self
            .store
            .update_conversation(
                conversation.id,
                &ConversationPatch {
                    last_bot_message_at: Some(now),
                    ..Default::default()
                },
                now,
            )
            .await?;

        self.bus.publish(OperatorEvent::MessageCreated {
            organization_id: integration.organization_id,
            conversation_id: conversation.id,
            message,
        });
        Ok(updated)
    }

    /// Raise the attention flag on the store and notify operators.
    /// A flagged conversation holds no pending nudges.
    async fn flag_attention(&self, conversation_id: Uuid, reason: &str) -> Result<Conversation> {
        let conversation = self
            .store
            .update_conversation(
                conversation_id,
                &ConversationPatch {
                    needs_human_attention: Some(true),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await?;
        self.store.cancel_pending_actions(conversation_id).await?;
        self.raise_attention(&conversation, reason);
        Ok(conversation)
    }

    fn raise_attention(&self, conversation: &Conversation, reason: &str) {
        let reason = if reason.is_empty() {
            "human attention requested"
        } else {
            reason
        };
        tracing::info!(
            conversation_id = %conversation.id,
            reason,
            "human attention raised"
        );
        self.bus.publish(OperatorEvent::AttentionRaised {
            organization_id: conversation.organization_id,
            conversation_id: conversation.id,
            reason: reason.to_owned(),
        });
    }

    /// Summarize on the same lane and publish the final conversation
    /// snapshot. Summary failures fall back to the dirty-append so the
    /// exchange is never lost.
    async fn finish_turn(
        &self,
        input: &PipelineInput,
        conversation: &Conversation,
        user_text: &str,
        bot_text: Option<&str>,
    ) {
        let summary = match self.reasoner.summarize(input, user_text, bot_text).await {
            Ok(out) => truncate_chars(&out.updated_rolling_summary, self.reply.summary_max_chars),
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    "summarize failed — dirty-appending exchange"
                );
                stages::dirty_append(
                    &conversation.rolling_summary,
                    user_text,
                    bot_text,
                    self.reply.dirty_summary_max_chars,
                )
            }
        };

        let final_conversation = self
            .store
            .update_conversation(
                conversation.id,
                &ConversationPatch {
                    rolling_summary: Some(summary),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await;

        match final_conversation {
            Ok(conversation) => {
                self.bus.publish(OperatorEvent::ConversationUpdated {
                    organization_id: conversation.organization_id,
                    conversation,
                });
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    "persisting summary failed"
                );
            }
        }
    }

    async fn discard(&self, action_id: Uuid) {
        if let Err(e) = self.store.delete_scheduled_action(action_id).await {
            tracing::warn!(action_id = %action_id, error = %e, "deleting follow-up failed");
        }
    }
}
