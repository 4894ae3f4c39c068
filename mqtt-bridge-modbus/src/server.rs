//! Modbus TCP server over the register bank.

use std::future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{Server, accept_tcp_connection};
use tracing::{debug, info, warn};

use crate::registers::{RegisterBank, RegisterError, RegisterSpace};

/// Maximum coils/inputs per read request (Modbus application protocol 6.1).
const MAX_READ_BITS: u16 = 2000;
/// Maximum registers per read request.
const MAX_READ_WORDS: u16 = 125;
/// Maximum coils per write request.
const MAX_WRITE_BITS: usize = 1968;
/// Maximum registers per write request.
const MAX_WRITE_WORDS: usize = 123;

impl From<RegisterError> for ExceptionCode {
    fn from(_: RegisterError) -> Self {
        ExceptionCode::IllegalDataAddress
    }
}

/// Per-connection Modbus service answering requests from the shared bank.
///
/// Every unit id is answered the same way.
#[derive(Clone)]
pub struct RegisterService {
    bank: Arc<RegisterBank>,
}

impl RegisterService {
    pub fn new(bank: Arc<RegisterBank>) -> Self {
        Self { bank }
    }

    fn read_bits(
        &self,
        space: RegisterSpace,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ExceptionCode> {
        check_quantity(count as usize, MAX_READ_BITS as usize)?;
        let values = self.bank.read(space, address, count)?;
        Ok(values.into_iter().map(|v| v != 0).collect())
    }

    fn read_words(
        &self,
        space: RegisterSpace,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ExceptionCode> {
        check_quantity(count as usize, MAX_READ_WORDS as usize)?;
        Ok(self.bank.read(space, address, count)?)
    }

    fn handle(&self, request: Request<'static>) -> Result<Response, ExceptionCode> {
        match request {
            Request::ReadCoils(address, count) => self
                .read_bits(RegisterSpace::Coils, address, count)
                .map(Response::ReadCoils),
            Request::ReadDiscreteInputs(address, count) => self
                .read_bits(RegisterSpace::DiscreteInputs, address, count)
                .map(Response::ReadDiscreteInputs),
            Request::ReadHoldingRegisters(address, count) => self
                .read_words(RegisterSpace::HoldingRegisters, address, count)
                .map(Response::ReadHoldingRegisters),
            Request::ReadInputRegisters(address, count) => self
                .read_words(RegisterSpace::InputRegisters, address, count)
                .map(Response::ReadInputRegisters),
            Request::WriteSingleCoil(address, coil) => {
                self.bank
                    .set_value(RegisterSpace::Coils, address, u16::from(coil))?;
                Ok(Response::WriteSingleCoil(address, coil))
            }
            Request::WriteMultipleCoils(address, coils) => {
                check_quantity(coils.len(), MAX_WRITE_BITS)?;
                let values: Vec<u16> = coils.iter().map(|c| u16::from(*c)).collect();
                self.bank.write(RegisterSpace::Coils, address, &values)?;
                Ok(Response::WriteMultipleCoils(address, values.len() as u16))
            }
            Request::WriteSingleRegister(address, value) => {
                self.bank
                    .set_value(RegisterSpace::HoldingRegisters, address, value)?;
                Ok(Response::WriteSingleRegister(address, value))
            }
            Request::WriteMultipleRegisters(address, values) => {
                check_quantity(values.len(), MAX_WRITE_WORDS)?;
                self.bank
                    .write(RegisterSpace::HoldingRegisters, address, &values)?;
                Ok(Response::WriteMultipleRegisters(address, values.len() as u16))
            }
            Request::ReadWriteMultipleRegisters(read_address, count, write_address, values) => {
                check_quantity(values.len(), MAX_WRITE_WORDS)?;
                self.bank
                    .write(RegisterSpace::HoldingRegisters, write_address, &values)?;
                self.read_words(RegisterSpace::HoldingRegisters, read_address, count)
                    .map(Response::ReadWriteMultipleRegisters)
            }
            Request::MaskWriteRegister(address, and_mask, or_mask) => {
                self.bank
                    .update(RegisterSpace::HoldingRegisters, address, |current| {
                        (current & and_mask) | (or_mask & !and_mask)
                    })?;
                Ok(Response::MaskWriteRegister(address, and_mask, or_mask))
            }
            other => {
                debug!(request = ?other, "Unsupported Modbus request");
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }
}

fn check_quantity(count: usize, max: usize) -> Result<(), ExceptionCode> {
    if count == 0 || count > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(())
}

impl tokio_modbus::server::Service for RegisterService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, request: Self::Request) -> Self::Future {
        future::ready(self.handle(request))
    }
}

/// Modbus TCP server bound to a listening socket.
pub struct ModbusServer {
    listener: TcpListener,
    bank: Arc<RegisterBank>,
}

impl ModbusServer {
    /// Bind the listening socket.
    pub async fn bind(addr: &str, bank: Arc<RegisterBank>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, bank })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the listener fails.
    pub async fn serve(self) -> io::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Modbus server listening");

        let bank = self.bank;
        let server = Server::new(self.listener);

        let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
            let bank = Arc::clone(&bank);
            async move {
                accept_tcp_connection(stream, socket_addr, move |peer: SocketAddr| {
                    debug!(peer = %peer, "Modbus client connected");
                    Ok(Some(RegisterService::new(Arc::clone(&bank))))
                })
            }
        };
        let on_process_error = |e: io::Error| {
            warn!(error = %e, "Modbus connection error");
        };

        server.serve(&on_connected, on_process_error).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{DEVICE_TYPE_ID, DEVICE_TYPE_REGISTER};
    use std::borrow::Cow;

    fn service() -> RegisterService {
        RegisterService::new(Arc::new(RegisterBank::new()))
    }

    #[test]
    fn test_read_device_type() {
        let service = service();

        let response = service
            .handle(Request::ReadHoldingRegisters(DEVICE_TYPE_REGISTER, 1))
            .unwrap();
        assert_eq!(response, Response::ReadHoldingRegisters(vec![DEVICE_TYPE_ID]));
    }

    #[test]
    fn test_device_type_write_rejected() {
        let service = service();

        assert_eq!(
            service.handle(Request::WriteSingleRegister(DEVICE_TYPE_REGISTER, 7)),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            service.handle(Request::WriteMultipleRegisters(
                99,
                Cow::Owned(vec![1, 1, 1])
            )),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            service.handle(Request::ReadHoldingRegisters(99, 3)).unwrap(),
            Response::ReadHoldingRegisters(vec![0, 2, 0])
        );
    }

    #[test]
    fn test_coil_round_trip() {
        let service = service();

        service
            .handle(Request::WriteMultipleCoils(
                10,
                Cow::Owned(vec![true, false, true]),
            ))
            .unwrap();
        service
            .handle(Request::WriteSingleCoil(11, true))
            .unwrap();

        assert_eq!(
            service.handle(Request::ReadCoils(10, 4)).unwrap(),
            Response::ReadCoils(vec![true, true, true, false])
        );
        assert_eq!(
            service.handle(Request::ReadDiscreteInputs(10, 1)).unwrap(),
            Response::ReadDiscreteInputs(vec![false])
        );
    }

    #[test]
    fn test_discrete_inputs_reflect_bank() {
        let bank = Arc::new(RegisterBank::new());
        let service = RegisterService::new(bank.clone());

        bank.set_value(RegisterSpace::DiscreteInputs, 1, 1).unwrap();
        assert_eq!(
            service.handle(Request::ReadDiscreteInputs(0, 3)).unwrap(),
            Response::ReadDiscreteInputs(vec![false, true, false])
        );
    }

    #[test]
    fn test_mask_write() {
        let service = service();

        service
            .handle(Request::WriteSingleRegister(4, 0x0012))
            .unwrap();
        service
            .handle(Request::MaskWriteRegister(4, 0x00F2, 0x0025))
            .unwrap();

        // Worked example from Modbus Application Protocol V1.1b, 6.16.
        assert_eq!(
            service.handle(Request::ReadHoldingRegisters(4, 1)).unwrap(),
            Response::ReadHoldingRegisters(vec![0x0017])
        );
    }

    #[test]
    fn test_read_write_multiple() {
        let service = service();

        let response = service
            .handle(Request::ReadWriteMultipleRegisters(
                0,
                3,
                1,
                Cow::Owned(vec![5, 6]),
            ))
            .unwrap();
        assert_eq!(response, Response::ReadWriteMultipleRegisters(vec![0, 5, 6]));
    }

    #[test]
    fn test_invalid_requests() {
        let service = service();

        assert_eq!(
            service.handle(Request::ReadCoils(999, 2)),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            service.handle(Request::ReadInputRegisters(0, 0)),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            service.handle(Request::ReadHoldingRegisters(0, 126)),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            service.handle(Request::ReadDiscreteInputs(0, 1000)).map(|_| ()),
            Ok(())
        );
        assert_eq!(
            service.handle(Request::WriteSingleCoil(1000, true)),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }
}
