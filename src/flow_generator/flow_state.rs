/*
 * Copyright (c) 2022 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use super::TimeoutKind;

use crate::common::enums::TcpFlags;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlowState {
    #[default]
    Raw,
    Opening1,
    Opening2,
    Established,
    ClosingTx1,
    ClosingTx2,
    ClosingRx1,
    ClosingRx2,
    Closed,
    Reset,
    Exception,

    ServerReset,
    ServerCandidateQueueLack,
    ClientL4PortReuse,
    Syn1,
    SynAck1,
    EstablishReset,
    OpeningRst,

    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateValue {
    pub timeout: TimeoutKind,
    pub state: FlowState,
    pub closed: bool,
}

impl StateValue {
    pub fn new(timeout: TimeoutKind, state: FlowState, closed: bool) -> Self {
        Self {
            timeout,
            state,
            closed,
        }
    }
}

const N_FLAGS: usize = TcpFlags::MASK.bits() as usize + 1;
const N_STATES: usize = FlowState::Max as usize;

const SYN: &[TcpFlags] = &[TcpFlags::SYN];
const SYN_ACK: &[TcpFlags] = &[TcpFlags::SYN_ACK];
const SYNS: &[TcpFlags] = &[TcpFlags::SYN, TcpFlags::SYN_ACK];
const FINS: &[TcpFlags] = &[TcpFlags::FIN, TcpFlags::FIN_ACK, TcpFlags::FIN_PSH_ACK];
const RSTS: &[TcpFlags] = &[TcpFlags::RST, TcpFlags::RST_ACK, TcpFlags::RST_PSH_ACK];
const ACKS: &[TcpFlags] = &[TcpFlags::ACK, TcpFlags::PSH_ACK, TcpFlags::PSH_ACK_URG];
const ACK: &[TcpFlags] = &[TcpFlags::ACK];

// 状态 x TCP Flags 的转移表，没有登记的组合返回None
pub struct StateMachine(Vec<Option<StateValue>>);

impl Default for StateMachine {
    fn default() -> Self {
        StateMachine(vec![None; N_STATES * N_FLAGS])
    }
}

impl StateMachine {
    fn set(
        &mut self,
        from: FlowState,
        flags: &[TcpFlags],
        timeout: TimeoutKind,
        to: FlowState,
        closed: bool,
    ) {
        let s = StateValue::new(timeout, to, closed);
        for f in flags {
            self.0[from as usize * N_FLAGS + f.bits() as usize] = Some(s);
        }
    }

    // 对于异常状态，任何报文都保持原状态
    fn set_sticky(&mut self, state: FlowState, timeout: TimeoutKind) {
        for flags in [SYNS, FINS, RSTS, ACKS] {
            self.set(state, flags, timeout, state, false);
        }
    }

    pub fn new_master() -> Self {
        use FlowState::*;
        use TimeoutKind as T;

        let mut m = StateMachine::default();

        // for FlowState::Raw
        m.set(Raw, SYN, T::Opening, Opening1, false);
        // FIN(正)
        m.set(Raw, FINS, T::Closing, ClosingTx1, false);
        m.set(Raw, RSTS, T::Closing, Reset, false);
        m.set(Raw, ACKS, T::Established, Established, false);

        // for FlowState::Opening1
        m.set(Opening1, SYN, T::Opening, Opening1, false);
        m.set(Opening1, FINS, T::Closing, ClosingTx1, false);
        m.set(Opening1, RSTS, T::Closing, EstablishReset, false);
        // 有ACK(正)
        m.set(Opening1, ACKS, T::Established, Established, false);

        // for FlowState::Opening2
        m.set(Opening2, SYN, T::Opening, Opening2, false);
        m.set(Opening2, FINS, T::Closing, ClosingTx1, false);
        m.set(Opening2, RSTS, T::OpeningRst, OpeningRst, false);
        m.set(Opening2, ACKS, T::Established, Established, false);

        // for FlowState::Established
        m.set(Established, SYN, T::Established, Established, false);
        m.set(Established, FINS, T::Closing, ClosingTx1, false);
        // 有RST(正、反一致)
        m.set(Established, RSTS, T::EstablishedRst, Reset, false);
        m.set(Established, ACKS, T::Established, Established, false);

        // for FlowState::ClosingTx1
        m.set(ClosingTx1, SYNS, T::Closing, ClosingTx1, false);
        m.set(ClosingTx1, FINS, T::Closing, ClosingTx1, false);
        m.set(ClosingTx1, RSTS, T::Closing, Reset, false);
        m.set(ClosingTx1, ACKS, T::Closing, ClosingTx1, false);

        // for FlowState::ClosingTx2
        m.set(ClosingTx2, SYNS, T::Closing, ClosingTx2, false);
        m.set(ClosingTx2, FINS, T::Closing, ClosingTx2, false);
        m.set(ClosingTx2, RSTS, T::ClosedFin, Reset, true);
        // 双方FIN之后的最后一个ACK(正)
        m.set(ClosingTx2, ACK, T::ClosedFin, Closed, true);

        // for FlowState::ClosingRx1
        m.set(ClosingRx1, SYNS, T::Closing, ClosingRx1, false);
        m.set(ClosingRx1, FINS, T::Closing, ClosingRx2, false);
        m.set(ClosingRx1, RSTS, T::Closing, Reset, false);
        m.set(ClosingRx1, ACKS, T::Closing, ClosingRx1, false);

        // for FlowState::ClosingRx2
        m.set(ClosingRx2, SYNS, T::Closing, ClosingRx2, false);
        m.set(ClosingRx2, FINS, T::Closing, ClosingRx2, false);
        m.set(ClosingRx2, RSTS, T::ClosedFin, Reset, true);
        m.set(ClosingRx2, ACKS, T::Closing, ClosingRx2, false);

        // for FlowState::Closed
        m.set(Closed, ACK, T::ClosedFin, Closed, false);

        // for FlowState::Reset
        m.set_sticky(Reset, T::Exception);

        // for FlowState::Syn1
        m.set(Syn1, SYN, T::Opening, Opening1, false);
        m.set(Syn1, RSTS, T::Closing, ClientL4PortReuse, false);
        m.set(Syn1, ACKS, T::Established, Established, false);
        m.set(Syn1, FINS, T::Closing, ClosingTx1, false);

        // for FlowState::SynAck1
        m.set(SynAck1, SYN, T::Established, Established, false);
        m.set(SynAck1, FINS, T::Closing, ClosingTx1, false);
        m.set(SynAck1, RSTS, T::Closing, Reset, false);
        m.set(SynAck1, ACKS, T::Established, SynAck1, false);

        m.set_sticky(ClientL4PortReuse, T::Exception);
        m.set_sticky(ServerCandidateQueueLack, T::Exception);
        m.set_sticky(ServerReset, T::Exception);
        m.set_sticky(EstablishReset, T::Exception);
        m.set_sticky(OpeningRst, T::OpeningRst);

        m
    }

    pub fn new_slave() -> Self {
        use FlowState::*;
        use TimeoutKind as T;

        let mut m = StateMachine::default();

        // for FlowState::Raw
        // SYN/ACK(反)
        m.set(Raw, SYN_ACK, T::Opening, Opening2, false);
        m.set(Raw, FINS, T::Closing, ClosingRx1, false);

        // for FlowState::Opening1
        m.set(Opening1, SYN_ACK, T::Opening, Opening2, false);
        // ACK(反)
        m.set(Opening1, ACKS, T::Opening, Syn1, false);
        m.set(Opening1, RSTS, T::Closing, ServerReset, false);
        m.set(Opening1, FINS, T::Closing, ClosingRx1, false);

        // for FlowState::Opening2
        m.set(Opening2, SYN_ACK, T::Opening, Opening2, false);
        m.set(Opening2, FINS, T::Closing, ClosingRx1, false);
        m.set(Opening2, RSTS, T::Closing, EstablishReset, false);

        // for FlowState::Established
        m.set(Established, SYN_ACK, T::Established, SynAck1, false);
        m.set(Established, FINS, T::Closing, ClosingRx1, false);

        // for FlowState::ClosingTx1
        m.set(ClosingTx1, FINS, T::Closing, ClosingTx2, false);

        // for FlowState::ClosingTx2
        m.set(ClosingTx2, ACKS, T::Closing, ClosingTx2, false);

        // for FlowState::ClosingRx1
        m.set(ClosingRx1, FINS, T::Closing, ClosingRx1, false);

        // for FlowState::ClosingRx2
        m.set(ClosingRx2, ACK, T::ClosedFin, Closed, true);

        // for FlowState::Closed
        m.set(Closed, ACK, T::ClosedFin, Closed, false);

        // for FlowState::Syn1
        m.set(Syn1, SYN_ACK, T::Opening, Opening2, false);
        m.set(Syn1, ACKS, T::Opening, Syn1, false);
        m.set(Syn1, FINS, T::Closing, ClosingRx1, false);
        m.set(Syn1, RSTS, T::Closing, EstablishReset, false);

        // for FlowState::SynAck1
        m.set(SynAck1, SYN_ACK, T::Established, SynAck1, false);
        m.set(SynAck1, FINS, T::Closing, ClosingRx1, false);
        m.set(SynAck1, RSTS, T::EstablishedRst, ServerCandidateQueueLack, false);
        m.set(SynAck1, ACKS, T::Established, Established, false);

        m.set_sticky(OpeningRst, T::OpeningRst);

        m
    }

    pub fn get(&self, state: FlowState, flags: TcpFlags) -> Option<&StateValue> {
        if state == FlowState::Max {
            return None;
        }
        self.0[state as usize * N_FLAGS + (flags.bits() & TcpFlags::MASK.bits()) as usize].as_ref()
    }
}
